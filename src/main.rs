mod cli;

use esi_pager::{Config, EnvToken, Executor, PageFetcher, TokenSource};
use log::info;
use serde_json::{json, Value};
use std::process::ExitCode;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let matches = cli::build_cli().get_matches();
    let opts = cli::CliOptions::from_matches(&matches);

    cli::init_logging(opts.log_level.as_deref());

    if opts.version {
        println!("esi-pager {}", env!("CARGO_PKG_VERSION"));
        return Ok(ExitCode::SUCCESS);
    }
    let Some(endpoint) = opts.endpoint.as_deref() else {
        anyhow::bail!("--endpoint is required");
    };

    let mut cfg = Config::from_env()?;
    if let Some(n) = opts.max_concurrent_pages {
        cfg = cfg.with_max_concurrent_pages(n);
    }
    if let Some(n) = opts.max_pages {
        cfg = cfg.with_max_pages(n);
    }
    let exec = Executor::new(cfg)?;
    let token = EnvToken("ESI_TOKEN".into()).access_token();
    if token.is_none() {
        info!("ESI_TOKEN not set; calling {} unauthenticated", endpoint);
    }

    let ok = if opts.all_pages {
        run_all_pages(exec, endpoint, token.as_deref()).await?
    } else {
        run_single(&exec, endpoint, token.as_deref()).await?
    };
    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

async fn run_single(exec: &Executor, endpoint: &str, token: Option<&str>) -> anyhow::Result<bool> {
    let env = exec.execute::<Value>(endpoint, token).await?;
    let error = match (env.error(), &env.decode_error) {
        (Some(err), _) => serde_json::to_value(&err)?,
        (None, Some(msg)) => json!({ "code": "deserialization_error", "message": msg }),
        (None, None) => Value::Null,
    };
    let ok = env.is_success() && env.decode_error.is_none();
    let out = json!({
        "status": env.status.as_u16(),
        "from_cache": env.from_cache,
        "data": env.payload,
        "error": error,
        "budget": env.budget,
    });
    println!("{}", serde_json::to_string(&out)?);
    Ok(ok)
}

async fn run_all_pages(exec: Executor, endpoint: &str, token: Option<&str>) -> anyhow::Result<bool> {
    let fetcher = PageFetcher::new(exec);
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = cancel_tx.send(true);
        }
    });

    let result = match fetcher
        .fetch_all_until::<Value>(endpoint, token, cancel_rx)
        .await
    {
        Ok(r) => r,
        Err(e) => {
            let out = json!({ "error": e.to_string() });
            println!("{}", serde_json::to_string(&out)?);
            return Ok(false);
        }
    };
    let warnings: Vec<String> = result.warnings.iter().map(|w| w.to_string()).collect();
    let out = json!({
        "items": result.items,
        "total_pages": result.total_pages,
        "missing_pages": result.missing_pages,
        "unrequested_pages": result.unrequested_pages,
        "failures": result.failures,
        "warnings": warnings,
        "cancelled": result.cancelled,
        "budget": fetcher.executor().budgets().snapshots(),
    });
    println!("{}", serde_json::to_string(&out)?);
    Ok(true)
}
