#[tokio::main]
async fn main() {
    if let Err(e) = chairside::run().await {
        eprintln!("chairside failed to start: {e}");
        std::process::exit(1);
    }
}
