fn main() {
    if let Err(err) = chat_bridge::cli::run_chat_bridge() {
        tracing::error!(error = %err, "chat-bridge failed");
        eprintln!("{err}");
        std::process::exit(1);
    }
}
