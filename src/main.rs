use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rand::{rngs::OsRng, RngCore};
use tracing::info;

use reward_ledger::{
    address::ADDRESS_LEN,
    snapshot::LiveWorld,
    Address, ClaimSignature, ClaimSigner, Clock, InMemoryIdentityRegistry, InMemoryToken,
    ManualClock, RewardConfig, RewardLedger, SignatureVerifier, SystemClock, TokenAccount, World,
};

#[derive(Parser)]
#[command(name = "reward-ledger")]
#[command(about = "Signature-authorized student/school incentive ledger", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// JSON file holding the token, registry and ledger state
    #[arg(long, global = true, default_value = "reward-ledger.state.json")]
    state: PathBuf,

    /// Address the operation is performed as
    #[arg(long, global = true)]
    caller: Option<Address>,

    /// Pin the clock to this unix time instead of the system clock
    #[arg(long, global = true)]
    now: Option<u64>,

    /// Optional TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a secp256k1 key and print its address
    Keygen {
        #[arg(long)]
        out_dir: PathBuf,
    },
    /// Print the address of a secret key
    KeyAddress {
        #[arg(long)]
        sk_hex: String,
    },
    /// Sign a timestamp as a student
    Sign {
        #[arg(long)]
        sk_hex: String,
        /// Defaults to --now, or the current time
        #[arg(long)]
        timestamp: Option<u64>,
    },
    /// Recover the signer of a timestamp signature
    Recover {
        #[arg(long)]
        timestamp: u64,
        #[arg(long)]
        signature: ClaimSignature,
    },
    /// Create a fresh state file owned by --caller
    Init {
        #[arg(long)]
        ledger_address: Option<Address>,
        #[arg(long)]
        token_address: Option<Address>,
        #[arg(long)]
        registry_address: Option<Address>,
        /// Overwrite an existing state file
        #[arg(long)]
        force: bool,
    },
    /// Mint payment tokens (token minter only)
    Mint {
        #[arg(long)]
        to: Address,
        #[arg(long)]
        amount: u64,
    },
    /// Allow a spender (the ledger by default) to pull tokens from --caller
    Approve {
        #[arg(long)]
        spender: Option<Address>,
        #[arg(long)]
        amount: u64,
    },
    /// Register --caller with the identity registry
    Register,
    /// Set the identity registry query price (registry owner only)
    SetQueryPrice {
        #[arg(long)]
        price: u64,
    },
    Deposit {
        #[arg(long)]
        amount: u64,
    },
    Withdraw {
        #[arg(long)]
        amount: u64,
    },
    AddStudent {
        #[arg(long)]
        student: Address,
        #[arg(long, default_value = "")]
        info: String,
    },
    UpdateStudent {
        #[arg(long)]
        student: Address,
        #[arg(long)]
        info: String,
    },
    RemoveStudent {
        #[arg(long)]
        student: Address,
    },
    ResetClaim {
        #[arg(long)]
        student: Address,
    },
    SetIncentive {
        #[arg(long)]
        student: Option<u64>,
        #[arg(long)]
        school: Option<u64>,
    },
    /// Submit a student's signature as the school given by --caller
    Claim {
        #[arg(long)]
        timestamp: u64,
        #[arg(long)]
        signature: ClaimSignature,
    },
    /// Print balances, configuration and the student table
    Show,
}

//==================== helpers ====================//

fn init_logging(config: &RewardConfig) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(config.logging.max_level())
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("Failed to set logging subscriber: {}", e))
}

fn require_caller(cli: &Cli) -> Result<Address> {
    cli.caller.context("--caller is required for this command")
}

fn clock(cli: &Cli) -> Arc<dyn Clock> {
    match cli.now {
        Some(now) => Arc::new(ManualClock::new(now)),
        None => Arc::new(SystemClock::new()),
    }
}

fn random_address() -> Address {
    let mut bytes = [0u8; ADDRESS_LEN];
    OsRng.fill_bytes(&mut bytes);
    Address(bytes)
}

fn load_world(cli: &Cli) -> Result<LiveWorld> {
    let raw = fs::read(&cli.state)
        .with_context(|| format!("reading state {} (run `init` first)", cli.state.display()))?;
    let world: World = serde_json::from_slice(&raw)
        .with_context(|| format!("parsing state {}", cli.state.display()))?;
    Ok(world.into_live(clock(cli))?)
}

fn save_world(path: &Path, world: &World) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let bytes = serde_json::to_vec_pretty(world).context("encoding state")?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes).with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}

/// Loads the state file, applies `op`, and writes the result back.
fn with_world(cli: &Cli, op: impl FnOnce(&mut LiveWorld) -> Result<()>) -> Result<()> {
    let mut world = load_world(cli)?;
    op(&mut world)?;
    save_world(&cli.state, &world.capture())
}

//==================== keys and signatures ====================//

fn keygen_cmd(out_dir: &Path) -> Result<()> {
    fs::create_dir_all(out_dir).with_context(|| format!("creating {}", out_dir.display()))?;
    let signer = ClaimSigner::generate();
    fs::write(out_dir.join("sk.hex"), signer.secret_hex()).context("writing sk.hex")?;
    fs::write(out_dir.join("address.txt"), signer.address().to_string())
        .context("writing address.txt")?;
    println!("{}", signer.address());
    Ok(())
}

fn signing_time(cli: &Cli, timestamp: Option<u64>) -> u64 {
    timestamp.unwrap_or_else(|| clock(cli).now())
}

fn sign_cmd(cli: &Cli, sk_hex: &str, timestamp: Option<u64>) -> Result<()> {
    let signer = ClaimSigner::from_hex(sk_hex).context("invalid --sk-hex")?;
    let timestamp = signing_time(cli, timestamp);
    let signature = signer.sign_timestamp(timestamp);
    println!("timestamp: {timestamp}");
    println!("signature: {signature}");
    println!("signer:    {}", signer.address());
    Ok(())
}

//==================== ledger state ====================//

fn init_cmd(
    cli: &Cli,
    config: &RewardConfig,
    ledger_address: Option<Address>,
    token_address: Option<Address>,
    registry_address: Option<Address>,
    force: bool,
) -> Result<()> {
    let owner = require_caller(cli)?;
    if cli.state.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", cli.state.display());
    }
    let token = InMemoryToken::new(token_address.unwrap_or_else(random_address), owner);
    let registry =
        InMemoryIdentityRegistry::new(registry_address.unwrap_or_else(random_address), owner);
    let ledger_address = ledger_address.unwrap_or_else(random_address);

    let token = Arc::new(token);
    let registry = Arc::new(registry);
    let ledger = RewardLedger::new(
        ledger_address,
        owner,
        registry.clone(),
        token.clone(),
        clock(cli),
    )
    .with_policy(config.claim)
    .with_incentives(config.incentives);

    save_world(&cli.state, &World::capture(&token, &registry, &ledger))?;
    info!(%owner, ledger = %ledger_address, "state initialized");
    println!("ledger:   {}", ledger.address());
    println!("token:    {}", ledger.payment_token());
    println!("registry: {}", ledger.identity_provider());
    Ok(())
}

fn show_cmd(cli: &Cli) -> Result<()> {
    let world = load_world(cli)?;
    let ledger = &world.ledger;
    println!("ledger:            {}", ledger.address());
    println!("owner:             {}", ledger.owner());
    println!("token:             {}", ledger.payment_token());
    println!("identity provider: {}", ledger.identity_provider());
    println!("balance:           {}", ledger.token_balance());
    println!(
        "incentives:        student={} school={}",
        ledger.student_incentive(),
        ledger.school_incentive()
    );
    let snapshot = ledger.snapshot();
    println!("state digest:      0x{}", hex::encode(snapshot.state_digest));
    for (student, record) in &snapshot.students {
        let last = record
            .last_claim
            .map(|t| t.to_string())
            .unwrap_or_else(|| "-".into());
        println!(
            "  {student} active={} last_claim={last} balance={} info={:?}",
            record.active,
            world.token.balance_of(student),
            record.info
        );
    }
    Ok(())
}

//==================== main ====================//

fn run(cli: &Cli, config: &RewardConfig) -> Result<()> {
    match &cli.command {
        Commands::Keygen { out_dir } => keygen_cmd(out_dir),
        Commands::KeyAddress { sk_hex } => {
            let signer = ClaimSigner::from_hex(sk_hex).context("invalid --sk-hex")?;
            println!("{}", signer.address());
            Ok(())
        }
        Commands::Sign { sk_hex, timestamp } => sign_cmd(cli, sk_hex, *timestamp),
        Commands::Recover {
            timestamp,
            signature,
        } => {
            let signer = SignatureVerifier::new().recover_signer(*timestamp, signature)?;
            println!("{signer}");
            Ok(())
        }
        Commands::Init {
            ledger_address,
            token_address,
            registry_address,
            force,
        } => init_cmd(
            cli,
            config,
            *ledger_address,
            *token_address,
            *registry_address,
            *force,
        ),
        Commands::Mint { to, amount } => {
            let caller = require_caller(cli)?;
            with_world(cli, |w| Ok(w.token.mint(&caller, to, *amount)?))
        }
        Commands::Approve { spender, amount } => {
            let caller = require_caller(cli)?;
            with_world(cli, |w| {
                let spender = spender.unwrap_or_else(|| w.ledger.address());
                w.token.approve(&caller, &spender, *amount);
                Ok(())
            })
        }
        Commands::Register => {
            let caller = require_caller(cli)?;
            with_world(cli, |w| {
                let key = w.registry.register(&caller);
                println!("registered {key}");
                Ok(())
            })
        }
        Commands::SetQueryPrice { price } => {
            let caller = require_caller(cli)?;
            with_world(cli, |w| Ok(w.registry.set_query_price(&caller, *price)?))
        }
        Commands::Deposit { amount } => {
            let caller = require_caller(cli)?;
            with_world(cli, |w| Ok(w.ledger.deposit(&caller, *amount)?))
        }
        Commands::Withdraw { amount } => {
            let caller = require_caller(cli)?;
            with_world(cli, |w| Ok(w.ledger.withdraw(&caller, *amount)?))
        }
        Commands::AddStudent { student, info } => {
            let caller = require_caller(cli)?;
            with_world(cli, |w| Ok(w.ledger.add_student(&caller, *student, info.as_str())?))
        }
        Commands::UpdateStudent { student, info } => {
            let caller = require_caller(cli)?;
            with_world(cli, |w| {
                Ok(w.ledger
                    .update_student_info(&caller, *student, info.as_str())?)
            })
        }
        Commands::RemoveStudent { student } => {
            let caller = require_caller(cli)?;
            with_world(cli, |w| Ok(w.ledger.remove_student(&caller, *student)?))
        }
        Commands::ResetClaim { student } => {
            let caller = require_caller(cli)?;
            with_world(cli, |w| Ok(w.ledger.reset_claim(&caller, *student)?))
        }
        Commands::SetIncentive { student, school } => {
            let caller = require_caller(cli)?;
            if student.is_none() && school.is_none() {
                bail!("pass --student and/or --school");
            }
            with_world(cli, |w| {
                if let Some(amount) = student {
                    w.ledger.set_student_incentive(&caller, *amount)?;
                }
                if let Some(amount) = school {
                    w.ledger.set_school_incentive(&caller, *amount)?;
                }
                Ok(())
            })
        }
        Commands::Claim {
            timestamp,
            signature,
        } => {
            let school = require_caller(cli)?;
            with_world(cli, |w| {
                let receipt = w.ledger.claim_reward(&school, *timestamp, signature)?;
                println!(
                    "paid student {} {} and school {} {}",
                    receipt.student, receipt.student_amount, receipt.school, receipt.school_amount
                );
                Ok(())
            })
        }
        Commands::Show => show_cmd(cli),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = RewardConfig::load(cli.config.as_deref())?;
    init_logging(&config)?;
    config.log_summary();
    run(&cli, &config)
}
