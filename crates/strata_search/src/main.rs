#[tokio::main]
async fn main() -> anyhow::Result<()> {
    strata_search::node::run_cli().await
}
