fn main() {
    // Endpoint overrides may live in a local .env during development
    let _ = dotenvy::dotenv();

    app_lib::run();
}
