fn main() {
    if let Err(err) = chatrelay::cli::main() {
        eprintln!("❌ {err}");
        std::process::exit(1);
    }
}
