use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    let config = nm_user_api::load_config()?;
    nm_user_api::run(config).await
}
