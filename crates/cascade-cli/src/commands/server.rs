//! `cascade server` — Start the Cascade HTTP backend server.

use std::path::PathBuf;

use cascade_core::CoreConfig;

pub async fn run(
    host: String,
    port: u16,
    db_path: String,
    skills_dir: String,
) -> Result<(), String> {
    let config = cascade_server::ServerConfig {
        host: host.clone(),
        port,
        db_path,
        core: CoreConfig {
            skills_dir: PathBuf::from(skills_dir),
            ..CoreConfig::default()
        },
    };

    println!("Starting Cascade server on {}:{}...", host, port);

    let addr = cascade_server::start_server(config).await?;
    println!("Cascade server listening on http://{}", addr);

    // Keep the process running until interrupted
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| format!("Failed to listen for Ctrl+C: {}", e))?;

    println!("\nShutting down...");
    Ok(())
}
