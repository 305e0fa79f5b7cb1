#[tokio::main]
async fn main() -> eyre::Result<()> {
    courier::work().start().await
}
