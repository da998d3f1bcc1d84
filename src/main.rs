use llm_gateway::gateway::AppState;
use llm_gateway::{gateway, logger, server};

#[tokio::main]
async fn main() {
    // Set up panic hook to log panics before they take the process down
    std::panic::set_hook(Box::new(|panic_info| {
        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic payload".to_string()
        };

        let location = if let Some(location) = panic_info.location() {
            format!(
                "{}:{}:{}",
                location.file(),
                location.line(),
                location.column()
            )
        } else {
            "Unknown location".to_string()
        };

        logger::error(
            "panic",
            &format!("PANIC occurred: message='{}', location='{}'", message, location),
        );
        eprintln!("FATAL PANIC: {} at {}", message, location);
    }));

    logger::init();
    logger::info("app", "Gateway starting");

    let state = AppState::from_env();
    gateway::spawn_cache_sweeper(&state);
    server::serve(state).await;
}
