use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    let config = nm_search_api::load_config()?;
    nm_search_api::run(config).await
}
