use std::collections::VecDeque;
use std::sync::Arc;

use batch_registry::anchor::{AnchorConfig, EvmLedger};
use batch_registry::batching::{BatchCoordinator, CoordinatorConfig, PendingResolution};
use batch_registry::config::RegistryConfig;
use batch_registry::crypto::{encode_leaf, parse_hash256, verify_with, HashScheme};
use batch_registry::domain::{to_hex, EligibleRecord, Hash256, RecordStatus};
use batch_registry::indexer::{ChainWatcher, Reconciler, WatcherConfig};
use batch_registry::infra::{Ledger, RecordStore, ShutdownCoordinator, SqliteRecordStore};
use batch_registry::proof::ProofService;
use batch_registry::telemetry::{init_telemetry, TelemetryConfig};
use uuid::Uuid;

fn print_help() {
    eprintln!(
        "\
batch-registry-admin

USAGE:
  batch-registry-admin <command> [options]

COMMANDS:
  migrate                         Run database migrations
  add-record                      Insert a record
  set-status                      Move a record along its lifecycle
  create-batch                    Batch selectable records and anchor the root
  resolve-pending                 Settle an OPEN snapshot after a timeout
  watch                           Reconcile ledger commit events
  prove                           Print an inclusion proof for a record
  verify-proof                    Verify an inclusion proof offline
  encode-leaf                     Print the leaf hash of a record

COMMON OPTIONS:
  --database-url <sqlite_url>     (defaults to env DATABASE_URL)

add-record OPTIONS:
  --identity-hash <hex>           (required)
  --file-hash <hex>               (required)
  --region-code <n>               (required, > 0)
  --eligible-since <unix_secs>    (required)
  --pending                       (optional) Insert as PENDING instead of ELIGIBLE

set-status OPTIONS:
  --identity-hash <hex>           (required)
  --status <eligible|selected|rejected>  (required)

create-batch OPTIONS:
  --limit <n>                     (default: BATCH_MAX_SIZE)

resolve-pending OPTIONS:
  --snapshot-id <uuid>            (required)

watch OPTIONS:
  --once                          Process available events and exit

prove OPTIONS:
  --identity-hash <hex>           (required)

verify-proof OPTIONS:
  --leaf-hash <hex>               (required) Hex-encoded leaf hash
  --merkle-root <hex>             (required) Hex-encoded Merkle root
  --proof-path <hex,hex,...>      (required) Comma-separated hex proof hashes
  --leaf-index <n>                (required) Leaf index in the tree
  --scheme <compat|domain_separated>  (defaults to env HASH_SCHEME)

encode-leaf OPTIONS:
  --identity-hash <hex>  --file-hash <hex>  --eligible-since <n>  --region-code <n>

ENV (ledger):
  LEDGER_RPC_URL / BATCH_REGISTRY_ADDRESS / OPERATOR_PRIVATE_KEY / LEDGER_CHAIN_ID
"
    );
}

fn value(args: &mut VecDeque<String>, flag: &str) -> anyhow::Result<String> {
    args.pop_front()
        .ok_or_else(|| anyhow::anyhow!("missing value for {flag}"))
}

fn required<T>(value: Option<T>, flag: &str) -> anyhow::Result<T> {
    value.ok_or_else(|| anyhow::anyhow!("{flag} is required"))
}

async fn open_store(
    database_url: Option<String>,
) -> anyhow::Result<(RegistryConfig, Arc<SqliteRecordStore>)> {
    let mut config = RegistryConfig::from_env()?;
    if let Some(url) = database_url {
        config.database_url = url;
    }
    let store = config.open_store().await?;
    Ok((config, Arc::new(store)))
}

fn open_ledger() -> anyhow::Result<Arc<dyn Ledger>> {
    let config = AnchorConfig::from_env().ok_or_else(|| {
        anyhow::anyhow!(
            "ledger not configured (set LEDGER_RPC_URL, BATCH_REGISTRY_ADDRESS, OPERATOR_PRIVATE_KEY)"
        )
    })?;
    Ok(Arc::new(EvmLedger::new(config)?))
}

fn coordinator(
    scheme: HashScheme,
    ledger: Arc<dyn Ledger>,
    store: Arc<dyn RecordStore>,
) -> BatchCoordinator {
    let reconciler = Arc::new(Reconciler::new(store.clone(), scheme));
    BatchCoordinator::new(
        CoordinatorConfig::from_env().with_scheme(scheme),
        ledger,
        store,
        reconciler,
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = init_telemetry(&TelemetryConfig::from_env()) {
        eprintln!("warning: logging not initialised: {e}");
    }

    let mut args: VecDeque<String> = std::env::args().skip(1).collect();
    let Some(command) = args.pop_front() else {
        print_help();
        return Ok(());
    };

    if matches!(command.as_str(), "-h" | "--help" | "help") {
        print_help();
        return Ok(());
    }

    let mut database_url: Option<String> = None;

    match command.as_str() {
        "migrate" => {
            while let Some(arg) = args.pop_front() {
                match arg.as_str() {
                    "--database-url" => database_url = Some(value(&mut args, &arg)?),
                    "-h" | "--help" => {
                        print_help();
                        return Ok(());
                    }
                    other => anyhow::bail!("unexpected argument: {other}"),
                }
            }

            let (config, _store) = open_store(database_url).await?;
            println!("ok: migrations applied to {}", config.database_url);
            Ok(())
        }
        "add-record" => {
            let mut identity_hash: Option<Hash256> = None;
            let mut file_hash: Option<Hash256> = None;
            let mut region_code: Option<u16> = None;
            let mut eligible_since: Option<u64> = None;
            let mut status = RecordStatus::Eligible;

            while let Some(arg) = args.pop_front() {
                match arg.as_str() {
                    "--database-url" => database_url = Some(value(&mut args, &arg)?),
                    "--identity-hash" => {
                        identity_hash =
                            Some(parse_hash256("identity_hash", &value(&mut args, &arg)?)?)
                    }
                    "--file-hash" => {
                        file_hash = Some(parse_hash256("file_hash", &value(&mut args, &arg)?)?)
                    }
                    "--region-code" => region_code = Some(value(&mut args, &arg)?.parse()?),
                    "--eligible-since" => {
                        eligible_since = Some(value(&mut args, &arg)?.parse()?)
                    }
                    "--pending" => status = RecordStatus::Pending,
                    "-h" | "--help" => {
                        print_help();
                        return Ok(());
                    }
                    other => anyhow::bail!("unexpected argument: {other}"),
                }
            }

            let region_code = required(region_code, "--region-code")?;
            if region_code == 0 {
                anyhow::bail!("--region-code must be positive");
            }
            let record = EligibleRecord::new(
                required(identity_hash, "--identity-hash")?,
                required(file_hash, "--file-hash")?,
                region_code,
                required(eligible_since, "--eligible-since")?,
            )
            .with_status(status);

            let (_, store) = open_store(database_url).await?;
            store.insert_record(&record).await?;
            println!("ok: record {} inserted ({})", to_hex(&record.identity_hash), status);
            println!("  leaf_hash: {}", to_hex(&record.leaf_hash()));
            Ok(())
        }
        "set-status" => {
            let mut identity_hash: Option<Hash256> = None;
            let mut status: Option<RecordStatus> = None;

            while let Some(arg) = args.pop_front() {
                match arg.as_str() {
                    "--database-url" => database_url = Some(value(&mut args, &arg)?),
                    "--identity-hash" => {
                        identity_hash =
                            Some(parse_hash256("identity_hash", &value(&mut args, &arg)?)?)
                    }
                    "--status" => {
                        status = Some(
                            value(&mut args, &arg)?
                                .parse()
                                .map_err(anyhow::Error::msg)?,
                        )
                    }
                    "-h" | "--help" => {
                        print_help();
                        return Ok(());
                    }
                    other => anyhow::bail!("unexpected argument: {other}"),
                }
            }

            let identity_hash = required(identity_hash, "--identity-hash")?;
            let status = required(status, "--status")?;

            let (_, store) = open_store(database_url).await?;
            let previous = store.transition_status(&identity_hash, status).await?;
            println!("ok: {} {} -> {}", to_hex(&identity_hash), previous, status);
            Ok(())
        }
        "create-batch" => {
            let mut limit: Option<usize> = None;

            while let Some(arg) = args.pop_front() {
                match arg.as_str() {
                    "--database-url" => database_url = Some(value(&mut args, &arg)?),
                    "--limit" => limit = Some(value(&mut args, &arg)?.parse()?),
                    "-h" | "--help" => {
                        print_help();
                        return Ok(());
                    }
                    other => anyhow::bail!("unexpected argument: {other}"),
                }
            }

            let (config, store) = open_store(database_url).await?;
            let coordinator = coordinator(config.scheme, open_ledger()?, store);
            let limit = limit.unwrap_or(coordinator.config().max_batch_size);

            match coordinator.create_batch_from_store(limit).await? {
                Some(result) => {
                    println!("{}", serde_json::to_string_pretty(&result)?);
                }
                None => println!("ok: nothing to batch"),
            }
            Ok(())
        }
        "resolve-pending" => {
            let mut snapshot_id: Option<Uuid> = None;

            while let Some(arg) = args.pop_front() {
                match arg.as_str() {
                    "--database-url" => database_url = Some(value(&mut args, &arg)?),
                    "--snapshot-id" => {
                        snapshot_id = Some(Uuid::parse_str(&value(&mut args, &arg)?)?)
                    }
                    "-h" | "--help" => {
                        print_help();
                        return Ok(());
                    }
                    other => anyhow::bail!("unexpected argument: {other}"),
                }
            }

            let snapshot_id = required(snapshot_id, "--snapshot-id")?;
            let (config, store) = open_store(database_url).await?;
            let coordinator = coordinator(config.scheme, open_ledger()?, store);

            match coordinator.resolve_pending(snapshot_id).await? {
                PendingResolution::Confirmed(result) => {
                    println!("{}", serde_json::to_string_pretty(&result)?);
                }
                PendingResolution::StillPending => println!("pending: not yet confirmed"),
                PendingResolution::Abandoned => println!("ok: snapshot abandoned"),
                PendingResolution::AlreadyClosed(state) => {
                    println!("ok: snapshot already {state}")
                }
            }
            Ok(())
        }
        "watch" => {
            let mut once = false;

            while let Some(arg) = args.pop_front() {
                match arg.as_str() {
                    "--database-url" => database_url = Some(value(&mut args, &arg)?),
                    "--once" => once = true,
                    "-h" | "--help" => {
                        print_help();
                        return Ok(());
                    }
                    other => anyhow::bail!("unexpected argument: {other}"),
                }
            }

            let (config, store) = open_store(database_url).await?;
            let store: Arc<dyn RecordStore> = store;
            let reconciler = Arc::new(Reconciler::new(store.clone(), config.scheme));
            let watcher =
                ChainWatcher::new(WatcherConfig::from_env(), open_ledger()?, store, reconciler);

            if once {
                let handled = watcher.catch_up().await?;
                println!("ok: {handled} events processed");
            } else {
                let shutdown = ShutdownCoordinator::new();
                let _signals = shutdown.listen_for_signals();
                watcher.run(shutdown.signal()).await?;
            }

            let stats = watcher.stats().await;
            println!(
                "applied={} skipped={} conflicts={} last_position={}",
                stats.batches_applied,
                stats.events_skipped,
                stats.conflicts,
                stats
                    .last_position
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".to_string())
            );
            Ok(())
        }
        "prove" => {
            let mut identity_hash: Option<Hash256> = None;

            while let Some(arg) = args.pop_front() {
                match arg.as_str() {
                    "--database-url" => database_url = Some(value(&mut args, &arg)?),
                    "--identity-hash" => {
                        identity_hash =
                            Some(parse_hash256("identity_hash", &value(&mut args, &arg)?)?)
                    }
                    "-h" | "--help" => {
                        print_help();
                        return Ok(());
                    }
                    other => anyhow::bail!("unexpected argument: {other}"),
                }
            }

            let identity_hash = required(identity_hash, "--identity-hash")?;
            let (config, store) = open_store(database_url).await?;
            let service = ProofService::new(store, config.scheme);

            let result = service.get_proof(&identity_hash).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        "verify-proof" => {
            let mut leaf_hash: Option<Hash256> = None;
            let mut merkle_root: Option<Hash256> = None;
            let mut proof_path: Option<String> = None;
            let mut leaf_index: Option<usize> = None;
            let mut scheme: Option<HashScheme> = None;

            while let Some(arg) = args.pop_front() {
                match arg.as_str() {
                    "--leaf-hash" => {
                        leaf_hash = Some(parse_hash256("leaf_hash", &value(&mut args, &arg)?)?)
                    }
                    "--merkle-root" => {
                        merkle_root =
                            Some(parse_hash256("merkle_root", &value(&mut args, &arg)?)?)
                    }
                    "--proof-path" => proof_path = Some(value(&mut args, &arg)?),
                    "--leaf-index" => leaf_index = Some(value(&mut args, &arg)?.parse()?),
                    "--scheme" => scheme = Some(value(&mut args, &arg)?.parse()?),
                    "-h" | "--help" => {
                        print_help();
                        return Ok(());
                    }
                    other => anyhow::bail!("unexpected argument: {other}"),
                }
            }

            let leaf = required(leaf_hash, "--leaf-hash")?;
            let root = required(merkle_root, "--merkle-root")?;
            let proof_path = required(proof_path, "--proof-path")?;
            let leaf_index = required(leaf_index, "--leaf-index")?;
            let scheme = match scheme {
                Some(scheme) => scheme,
                None => RegistryConfig::from_env()?.scheme,
            };

            // An empty path is the single-leaf tree
            let proof: Vec<Hash256> = proof_path
                .split(',')
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(|h| parse_hash256("proof_path", h))
                .collect::<Result<_, _>>()?;

            if verify_with(scheme, &leaf, &proof, leaf_index, &root) {
                println!("ok: proof is VALID");
                println!("  leaf_hash:   {}", to_hex(&leaf));
                println!("  leaf_index:  {}", leaf_index);
                println!("  merkle_root: {}", to_hex(&root));
                println!("  proof_depth: {}", proof.len());
                println!("  scheme:      {}", scheme);
                Ok(())
            } else {
                anyhow::bail!("proof is INVALID")
            }
        }
        "encode-leaf" => {
            let mut identity_hash: Option<String> = None;
            let mut file_hash: Option<String> = None;
            let mut eligible_since: Option<u64> = None;
            let mut region_code: Option<u16> = None;

            while let Some(arg) = args.pop_front() {
                match arg.as_str() {
                    "--identity-hash" => identity_hash = Some(value(&mut args, &arg)?),
                    "--file-hash" => file_hash = Some(value(&mut args, &arg)?),
                    "--eligible-since" => {
                        eligible_since = Some(value(&mut args, &arg)?.parse()?)
                    }
                    "--region-code" => region_code = Some(value(&mut args, &arg)?.parse()?),
                    "-h" | "--help" => {
                        print_help();
                        return Ok(());
                    }
                    other => anyhow::bail!("unexpected argument: {other}"),
                }
            }

            let decode = |flag: &str, raw: Option<String>| -> anyhow::Result<Vec<u8>> {
                let raw = required(raw, flag)?;
                hex::decode(raw.trim_start_matches("0x"))
                    .map_err(|_| anyhow::anyhow!("invalid hex for {flag}"))
            };
            let leaf = encode_leaf(
                &decode("--identity-hash", identity_hash)?,
                &decode("--file-hash", file_hash)?,
                required(eligible_since, "--eligible-since")?,
                required(region_code, "--region-code")?,
            )?;
            println!("{}", to_hex(&leaf));
            Ok(())
        }
        other => {
            print_help();
            anyhow::bail!("unknown command: {other}")
        }
    }
}
