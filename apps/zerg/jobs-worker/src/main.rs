//! Jobs Worker Service - Entry Point
//!
//! Background worker that executes queued jobs (emails, audit log cleanup).

#[tokio::main]
async fn main() -> eyre::Result<()> {
    zerg_jobs_worker::run().await
}
