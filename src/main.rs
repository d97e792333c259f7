/// FillTheHole server binary
use fillthehole::{config::ServerConfig, jobs, server, AppContext, HoleResult};
use std::sync::Arc;

#[tokio::main]
async fn main() -> HoleResult<()> {
    // Load configuration
    let config = ServerConfig::from_env()?;

    // Initialize logging
    fillthehole::init_tracing(&config.logging);

    // Print banner
    print_banner();

    // Create application context
    let ctx = Arc::new(AppContext::new(config).await?);

    // Start background jobs
    let scheduler = Arc::new(jobs::JobScheduler::new(Arc::clone(&ctx)));
    scheduler.start();

    // Start server
    server::serve((*ctx).clone()).await?;

    Ok(())
}

fn print_banner() {
    println!(
        r#"
    _______ ____   ________            __  __      __
   / ____(_) / /  /_  __/ /_  ___     / / / /___  / /__
  / /_  / / / /    / / / __ \/ _ \   / /_/ / __ \/ / _ \
 / __/ / / / /    / / / / / /  __/  / __  / /_/ / /  __/
/_/   /_/_/_/    /_/ /_/ /_/\___/  /_/ /_/\____/_/\___/

        Pothole reporting service v{}
        "#,
        env!("CARGO_PKG_VERSION")
    );
}
