#[tokio::main]
async fn main() -> eyre::Result<()> {
    courier::serve().start().await
}
