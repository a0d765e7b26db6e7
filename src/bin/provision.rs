use std::ffi::CString;

use anyhow::{anyhow, Context, Result};
use argh::FromArgs;
use ntag424_coin_provision::keystore::{KeyStore, Outcome, Uid};
use ntag424_coin_provision::transport::PcscTransport;
use ntag424_coin_provision::{commands, inspector, provisioning};

/// Provision, inspect, and manage NTAG424 DNA game-coin tags.
#[derive(FromArgs)]
struct Cli {
    /// path to the key store CSV (default: keys.csv)
    #[argh(option, default = "String::from(\"keys.csv\")")]
    store: String,

    /// PC/SC reader name substring to connect to; the first matching
    /// reader is used when omitted
    #[argh(option)]
    reader: Option<String>,

    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Command {
    Provision(ProvisionArgs),
    Inspect(InspectArgs),
    ListCoin(ListCoinArgs),
    AssignCoin(AssignCoinArgs),
    Reset(ResetArgs),
}

/// Provision a factory or previously-provisioned tag for a coin side.
#[derive(FromArgs)]
#[argh(subcommand, name = "provision")]
struct ProvisionArgs {
    /// coin identifier this tag belongs to
    #[argh(option)]
    coin_name: String,

    /// "heads" or "tails"
    #[argh(option)]
    outcome: String,

    /// the https:// URL template the NDEF record is built from
    #[argh(option)]
    url_template: String,
}

/// Read a tag's state without mutating it.
#[derive(FromArgs)]
#[argh(subcommand, name = "inspect")]
struct InspectArgs {}

/// List the UID(s) registered under a coin name.
#[derive(FromArgs)]
#[argh(subcommand, name = "list-coin")]
struct ListCoinArgs {
    #[argh(positional)]
    coin_name: String,
}

/// Assign a coin name/outcome to an already-provisioned tag.
#[derive(FromArgs)]
#[argh(subcommand, name = "assign-coin")]
struct AssignCoinArgs {
    #[argh(option)]
    uid: String,

    #[argh(option)]
    coin_name: String,

    #[argh(option)]
    outcome: String,
}

/// Reset a tag back to factory keys and an unlocked file 02.
#[derive(FromArgs)]
#[argh(subcommand, name = "reset")]
struct ResetArgs {
    #[argh(option)]
    uid: String,

    /// current PICC master key, 32 hex characters
    #[argh(option)]
    current_key: String,
}

fn parse_outcome(s: &str) -> Result<Outcome> {
    match s {
        "heads" => Ok(Outcome::Heads),
        "tails" => Ok(Outcome::Tails),
        other => Err(anyhow!("outcome must be \"heads\" or \"tails\", got {other:?}")),
    }
}

fn parse_key(s: &str) -> Result<[u8; 16]> {
    let bytes = hex::decode(s).context("key must be hex-encoded")?;
    bytes
        .try_into()
        .map_err(|_| anyhow!("key must be exactly 32 hex characters (16 bytes)"))
}

fn connect(reader_substring: Option<&str>) -> Result<PcscTransport> {
    let ctx = pcsc::Context::establish(pcsc::Scope::User).context("establish PC/SC context")?;
    let mut buf = vec![0u8; ctx.list_readers_len().context("list readers")?];
    let readers: Vec<&std::ffi::CStr> = ctx.list_readers(&mut buf).context("list readers")?.collect();
    let chosen: &std::ffi::CStr = match reader_substring {
        Some(substr) => readers
            .into_iter()
            .find(|r| r.to_string_lossy().contains(substr))
            .ok_or_else(|| anyhow!("no reader matching {substr:?}"))?,
        None => *readers.first().ok_or_else(|| anyhow!("no PC/SC readers found"))?,
    };
    let name: CString = chosen.to_owned();
    PcscTransport::connect(&ctx, &name).map_err(|e| anyhow!("{e}"))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli: Cli = argh::from_env();
    let mut store = KeyStore::open(&cli.store).map_err(|e| anyhow!("{e}")).context("open key store")?;

    match cli.command {
        Command::Provision(args) => {
            let outcome = parse_outcome(&args.outcome)?;
            let mut transport = connect(cli.reader.as_deref())?;
            let record = provisioning::provision(&mut transport, &mut store, &args.coin_name, outcome, &args.url_template)
                .map_err(|e| anyhow!("{e}"))
                .context("provisioning failed")?;
            tracing::info!(uid = %record.uid, coin_name = %record.coin_name, "tag provisioned");
            println!("provisioned {} for coin {:?}", record.uid, record.coin_name);
        }
        Command::Inspect(_) => {
            let mut transport = connect(cli.reader.as_deref())?;
            let mut tag = commands::Tag::new(&mut transport);
            tag.select_picc_application().map_err(|e| anyhow!("{e}")).context("select PICC application")?;
            let state = inspector::classify(&mut tag, &store).map_err(|e| anyhow!("{e}")).context("classify tag")?;
            println!("uid: {}", state.uid);
            println!("label: {:?}", state.label);
            println!("inconsistent: {} ({})", state.inconsistent, state.reason);
            println!("ndef present: {}", state.ndef_present);
            println!("key versions (0,1,3): {:?}", state.key_versions);
            if let Some(record) = &state.store_record {
                println!("store record: coin={:?} status={:?}", record.coin_name, record.status);
            }
        }
        Command::ListCoin(args) => {
            let uids = store.list_coin(&args.coin_name);
            for uid in uids {
                println!("{uid}");
            }
        }
        Command::AssignCoin(args) => {
            let uid = Uid::try_from(args.uid.as_str()).map_err(|e| anyhow!("{e}"))?;
            let outcome = parse_outcome(&args.outcome)?;
            store
                .assign_coin(&uid, &args.coin_name, outcome)
                .map_err(|e| anyhow!("{e}"))
                .context("assign coin")?;
            println!("assigned {uid} to coin {:?} ({:?})", args.coin_name, outcome);
        }
        Command::Reset(args) => {
            let uid = Uid::try_from(args.uid.as_str()).map_err(|e| anyhow!("{e}"))?;
            let current_key = parse_key(&args.current_key)?;
            let mut transport = connect(cli.reader.as_deref())?;
            provisioning::reset(&mut transport, &mut store, uid.clone(), current_key)
                .map_err(|e| anyhow!("{e}"))
                .context("reset failed")?;
            println!("reset {uid} to factory defaults");
        }
    }

    Ok(())
}
