#[tokio::main]
async fn main() {
    if let Err(err) = lead_sync::app::run().await {
        tracing::error!(error = %err, "lead sync server failed");
        eprintln!("lead sync server failed: {err}");
        std::process::exit(1);
    }
}
