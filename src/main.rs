use actix_web::{middleware, web, App, HttpServer};
use std::io;
use std::path::Path;

use mangaflow::api;
use mangaflow::app_state::AppState;
use mangaflow::config::Config;
use mangaflow::logging;

#[actix_web::main]
async fn main() -> io::Result<()> {
    logging::init(Path::new("log4rs.yml"));

    let cfg = Config::load();
    let bind = (cfg.server.host.clone(), cfg.server.port);

    log::info!("HTTP client:");
    log::info!("  Max retries: {}", cfg.http.max_retries);
    log::info!("  Timeout: {}s", cfg.http.timeout_secs);
    log::info!("  Search timeout: {}s", cfg.sync.search_timeout_secs);

    let state = AppState::from_config(cfg).map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    let data = web::Data::new(state);
    let shutdown = data.shutdown.clone();

    log::info!("Starting server on {}:{}", bind.0, bind.1);
    let server = HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .wrap(middleware::Logger::default())
            .configure(api::configure)
    })
    .bind(bind)?
    .run();

    let result = server.await;
    shutdown.cancel();
    log::info!("Server stopped");
    result
}
