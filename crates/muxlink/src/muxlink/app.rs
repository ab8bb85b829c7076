use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::task::JoinSet;

use crate::muxlink::{admin, config, logging, net, telemetry, tunnel};

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;

    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    tracing::info!(
        config = %resolved.path.display(),
        source = %resolved.source,
        server = %cfg.client.server_addr,
        routes = cfg.routes.len(),
        max_bridges = cfg.client.max_bridges,
        local_dial_timeout = %humantime::format_duration(cfg.client.local_dial_timeout),
        admin_addr = %cfg.admin_addr,
        "muxlink: starting"
    );

    let prom = Arc::new(telemetry::init_prometheus()?);

    // Session and registration failures are fatal: without a session and a
    // route table there is nothing to serve.
    let client = tunnel::client::Client::connect(client_options(&cfg)).await?;
    client.register_routes().await?;
    let client = Arc::new(client);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();

    if !cfg.admin_addr.trim().is_empty() {
        let admin_addr = net::normalize_bind_addr(&cfg.admin_addr);
        let addr: SocketAddr = admin_addr
            .parse()
            .with_context(|| format!("invalid admin_addr: {}", cfg.admin_addr))?;

        let admin_state = admin::AdminState {
            prom: prom.clone(),
            registry: client.registry(),
            session: client.session(),
            started_at_unix_ms: telemetry::now_unix_ms(),
        };

        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve_with_shutdown(addr, admin_state, shutdown).await });
    }

    {
        let client = client.clone();
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { client.run(shutdown).await.map_err(anyhow::Error::from) });
    }

    // Wait for shutdown signal (Ctrl-C / SIGTERM) or the first task to end.
    // The session is never re-dialed: losing it ends the process.
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            let _ = shutdown_tx.send(true);
            if let Some(res) = res {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        tracing::error!(err = %format!("{err:#}"), "muxlink: fatal");
                        drain(&mut tasks).await;
                        return Err(err);
                    }
                    Err(join_err) => return Err(join_err.into()),
                }
            }
        }
    }

    drain(&mut tasks).await;
    Ok(())
}

fn client_options(cfg: &config::Config) -> tunnel::client::ClientOptions {
    tunnel::client::ClientOptions {
        server_addr: cfg.client.server_addr.clone(),
        dial_timeout: cfg.client.dial_timeout,
        call_timeout: cfg.control.call_timeout,
        routes: cfg
            .routes
            .iter()
            .map(|r| tunnel::client::RouteSpec {
                remote: r.remote.clone(),
                local: r.local.clone(),
            })
            .collect(),
        demux: tunnel::demux::DemuxOptions {
            local_dial_timeout: cfg.client.local_dial_timeout,
            max_bridges: cfg.client.max_bridges,
        },
    }
}

// Tasks are expected to observe shutdown; only enforce a timeout if something hangs.
async fn drain(tasks: &mut JoinSet<anyhow::Result<()>>) {
    let wait = async {
        while let Some(_res) = tasks.join_next().await {
            // Errors during teardown are not interesting.
        }
    };

    let drain_timeout = Duration::from_secs(5);
    if tokio::time::timeout(drain_timeout, wait).await.is_err() {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }
}

async fn shutdown_signal() {
    // Ctrl-C works cross-platform.
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::muxlink::tunnel::registry::Target;

    #[test]
    fn client_options_carry_config() {
        let dir = std::env::temp_dir().join(format!(
            "muxlink_app_test_{}_{}",
            std::process::id(),
            telemetry::now_unix_ms()
        ));
        std::fs::create_dir_all(&dir).expect("mkdir");
        let path = dir.join("muxlink.toml");
        std::fs::write(
            &path,
            r#"
[client]
server_addr = "unix:/run/muxlink.sock"
local_dial_timeout_ms = 750
max_bridges = 8

[control]
call_timeout_ms = 2000

[[routes]]
remote = ":8080"
local = "127.0.0.1:9000"
"#,
        )
        .expect("write");

        let cfg = config::load_config(&path).expect("load");
        let opts = client_options(&cfg);
        assert_eq!(opts.server_addr, Target::Unix("/run/muxlink.sock".into()));
        assert_eq!(opts.call_timeout, Duration::from_secs(2));
        assert_eq!(opts.demux.local_dial_timeout, Duration::from_millis(750));
        assert_eq!(opts.demux.max_bridges, 8);
        assert_eq!(opts.routes.len(), 1);
        assert_eq!(opts.routes[0].remote, Target::Tcp(":8080".into()));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
