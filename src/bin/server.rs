//! Demo FastCGI responder binary: wires configuration, logging, the
//! worker pool, and a small echo application together into a runnable
//! server.
//!
//! The application itself is a stand-in, grounded in the teacher's
//! `uploadterrain.rs`/`echo.rs` shape (echo environment and params back
//! as plain text) -- the point of this binary is to exercise the engine
//! end to end, not to ship a real app.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, LevelFilter};

use minifcgi::config::{BindMode, Cli, ServerConfig};
use minifcgi::gateway::{http_headers, Application, Environ, IterBody, ResponseBody, StartResponse};
use minifcgi::server;
use minifcgi::WorkerPool;

struct EchoApplication;

impl Application for EchoApplication {
    fn call(
        &self,
        environ: &Environ,
        responder: &mut dyn StartResponse,
    ) -> io::Result<Box<dyn ResponseBody + Send>> {
        responder
            .start_response(
                "200 OK",
                vec![(
                    "Content-Type".to_string(),
                    "text/plain; charset=utf-8".to_string(),
                )],
                None,
            )
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        let headers: HashMap<String, String> = http_headers(environ);
        let body = format!(
            "method: {}\npath: {}\nheaders: {:?}\nbody: {}\n",
            environ.get("REQUEST_METHOD").unwrap_or("?"),
            environ.get("REQUEST_URI").unwrap_or("?"),
            headers,
            String::from_utf8_lossy(&environ.input),
        );
        Ok(Box::new(IterBody::new(vec![body.into_bytes()])) as Box<dyn ResponseBody + Send>)
    }
}

fn init_logging(level: &str) {
    let filter = level.parse::<LevelFilter>().unwrap_or(LevelFilter::Info);
    let _ = simplelog::CombinedLogger::init(vec![simplelog::TermLogger::new(
        filter,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    )]);
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config: ServerConfig = cli.resolve().context("failed to resolve server configuration")?;

    init_logging(&config.log_level);
    info!("starting minifcgi-server");

    let pool = WorkerPool::new(config.min_workers, config.max_workers);
    let app: Arc<dyn Application> = Arc::new(EchoApplication);

    match config.bind {
        BindMode::Inherited => {
            let listener = server::init_inherited_fcgi_socket()
                .context("fd 0 is not an inherited FastCGI socket")?;
            server::serve(listener, pool, app);
        }
        BindMode::Unix { path } => {
            let listener = server::bind_unix_socket(&path, config.umask, config.listen_backlog)
                .with_context(|| format!("failed to bind unix socket at {path}"))?;
            info!("listening on unix socket {path}");
            server::serve(listener, pool, app);
        }
    }
}
