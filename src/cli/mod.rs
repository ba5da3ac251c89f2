//! CLI module for the mazad command-line client.
//!
//! Subcommands for the auction marketplace backend:
//! - `login` / `register` / `verify` / `logout` - account lifecycle
//! - `whoami` - show the stored session
//! - `auctions ...` - browse and manage auction listings
//! - `account ...` - profile management
//! - `config check` - validate configuration file

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use lazy_static::lazy_static;
use regex::Regex;
use std::path::PathBuf;
use std::sync::Arc;

use crate::auctions::{AuctionClient, AuctionUpdate, NewAuction};
use crate::auth::lifecycle::{AuthError, AuthLifecycle, LoginOutcome, VerifyOutcome};
use crate::auth::{HttpAuthTransport, RegisterRequest};
use crate::config::Config;
use crate::gateway::Gateway;
use crate::session::SessionHandle;
use crate::store::{PendingUpdate, SessionStore};
use crate::users::{UserClient, UserUpdate};

/// CLI arguments structure
#[derive(Parser, Debug)]
#[command(name = "mazad")]
#[command(author, version, about = "Command-line client for the Mazad auction marketplace", long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "mazad.toml")]
    pub config: PathBuf,

    /// Override log level
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Backend URL (overrides the config file)
    #[arg(long, env = "MAZAD_API_URL")]
    pub api_url: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Log in with email and password
    Login {
        email: String,
        #[arg(short, long, env = "MAZAD_PASSWORD", hide_env_values = true)]
        password: String,
    },

    /// Register a new account
    Register {
        #[arg(long)]
        email: String,
        #[arg(long, env = "MAZAD_PASSWORD", hide_env_values = true)]
        password: String,
        #[arg(long)]
        firstname: Option<String>,
        #[arg(long)]
        lastname: Option<String>,
        /// National identity card number
        #[arg(long)]
        cin: Option<i64>,
        /// Profile photo to upload
        #[arg(long)]
        photo: Option<PathBuf>,
    },

    /// Verify the account with the emailed 6-digit code
    Verify {
        code: String,
    },

    /// Log out and clear the stored session
    Logout,

    /// Show the current session
    Whoami,

    /// Auction management commands
    #[command(subcommand)]
    Auctions(AuctionsCommands),

    /// Profile management commands
    #[command(subcommand)]
    Account(AccountCommands),

    /// Configuration management commands
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Auctions subcommands
#[derive(Subcommand, Debug)]
pub enum AuctionsCommands {
    /// List all auctions
    List,
    /// Show details for a specific auction
    Show {
        id: i64,
    },
    /// List your own auctions
    Mine,
    /// Create a new auction
    Create {
        #[arg(long)]
        title: String,
        #[arg(long)]
        description: String,
        #[arg(long)]
        starting_price: f64,
        #[arg(long)]
        category: String,
        /// Photos to attach (repeatable)
        #[arg(long)]
        photo: Vec<PathBuf>,
    },
    /// Update an auction
    Update {
        id: i64,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        starting_price: Option<f64>,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        status: Option<String>,
    },
    /// Delete an auction
    Delete {
        id: i64,
    },
}

/// Account subcommands
#[derive(Subcommand, Debug)]
pub enum AccountCommands {
    /// Show your profile
    Show,
    /// Update your profile
    Update {
        #[arg(long)]
        firstname: Option<String>,
        #[arg(long)]
        lastname: Option<String>,
        #[arg(long)]
        cin: Option<i64>,
        /// Replace the profile photo
        #[arg(long)]
        photo: Option<PathBuf>,
    },
    /// Remove your profile photo
    DeletePhoto,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Validate configuration file
    Check,
}

/// Everything a command handler needs, wired once per invocation.
struct ClientContext {
    store: SessionStore,
    session: SessionHandle,
    auctions: AuctionClient,
    users: UserClient,
}

async fn connect(cli: &Cli, config: &Config) -> Result<ClientContext> {
    let mut api = config.api.clone();
    if let Some(url) = &cli.api_url {
        api.base_url = url.clone();
    }

    let store = SessionStore::open(&config.storage.data_dir).await?;
    let gateway = Gateway::new(&api, store.clone())?;
    let transport = Arc::new(HttpAuthTransport::new(gateway.clone()));
    let lifecycle = Arc::new(AuthLifecycle::new(transport, store.clone()));

    let session = SessionHandle::new(lifecycle);
    session.restore().await?;

    Ok(ClientContext {
        store,
        session,
        auctions: AuctionClient::new(gateway.clone()),
        users: UserClient::new(gateway),
    })
}

/// Run a CLI command
pub async fn run_command(cli: &Cli, config: &Config) -> Result<()> {
    match &cli.command {
        Commands::Login { email, password } => cmd_login(cli, config, email, password).await,
        Commands::Register {
            email,
            password,
            firstname,
            lastname,
            cin,
            photo,
        } => {
            let request = RegisterRequest {
                email: email.clone(),
                password: password.clone(),
                firstname: firstname.clone(),
                lastname: lastname.clone(),
                cin: *cin,
            };
            cmd_register(cli, config, &request, photo.as_deref()).await
        }
        Commands::Verify { code } => cmd_verify(cli, config, code).await,
        Commands::Logout => cmd_logout(cli, config).await,
        Commands::Whoami => cmd_whoami(cli, config).await,
        Commands::Auctions(command) => cmd_auctions(cli, config, command).await,
        Commands::Account(command) => cmd_account(cli, config, command).await,
        Commands::Config(ConfigCommands::Check) => cmd_config_check(cli).await,
    }
}

async fn cmd_login(cli: &Cli, config: &Config, email: &str, password: &str) -> Result<()> {
    validate_email(email)?;
    let ctx = connect(cli, config).await?;

    match ctx.session.login(email, password).await {
        Ok(LoginOutcome::Authenticated(session)) => {
            println!("[OK] Logged in as {}", session.user.email);
            println!();
            print_user(&session.user);
            Ok(())
        }
        Ok(LoginOutcome::AwaitingVerification { code, .. }) => {
            println!("[!] Your account is still waiting for validation.");
            if code.is_some() {
                println!();
                println!("A verification code was sent to your email address.");
                println!("Run 'mazad verify <code>' to activate your account.");
            }
            Ok(())
        }
        Err(e) => bail!("Login failed: {e}"),
    }
}

async fn cmd_register(
    cli: &Cli,
    config: &Config,
    request: &RegisterRequest,
    photo: Option<&std::path::Path>,
) -> Result<()> {
    validate_email(&request.email)?;
    if request.password.trim().is_empty() {
        bail!("Password must not be empty");
    }

    let ctx = connect(cli, config).await?;
    let registered = ctx
        .session
        .register(request, photo)
        .await
        .map_err(|e| anyhow::anyhow!("Registration failed: {e}"))?;

    // Remember the artifacts the verification step will consume. The
    // password is cached so verify can log in automatically.
    ctx.store
        .set_pending(PendingUpdate {
            code: registered.code.clone(),
            email: Some(request.email.clone()),
            password: Some(request.password.clone()),
        })
        .await?;

    println!("[OK] Account created for {}", request.email);
    println!();
    if registered.code.is_some() {
        println!("A verification code was sent to your email address.");
        println!("Run 'mazad verify <code>' to activate your account.");
    } else {
        println!("Check your email for activation instructions.");
    }
    println!();
    Ok(())
}

async fn cmd_verify(cli: &Cli, config: &Config, code: &str) -> Result<()> {
    let ctx = connect(cli, config).await?;

    match ctx.session.verify(code).await {
        Ok(VerifyOutcome::Authenticated(session)) => {
            println!("[OK] Account activated and logged in as {}", session.user.email);
            Ok(())
        }
        Ok(VerifyOutcome::ActivatedNoAutologin) => {
            println!("[OK] Account activated.");
            println!();
            println!("Run 'mazad login <email>' to sign in.");
            Ok(())
        }
        Ok(VerifyOutcome::ActivatedAutologinRejected) => {
            println!("[OK] Account activated, but automatic login failed.");
            println!();
            println!("Run 'mazad login <email>' to sign in manually.");
            Ok(())
        }
        Err(AuthError::NoPendingVerification) => {
            bail!("No verification in progress. Run 'mazad register' first.")
        }
        Err(e) => bail!("Verification failed: {e}"),
    }
}

async fn cmd_logout(cli: &Cli, config: &Config) -> Result<()> {
    let ctx = connect(cli, config).await?;

    if ctx.session.logout().await {
        println!("[OK] Logged out.");
    } else {
        // In-memory state is already cleared; only the on-disk copy may
        // linger until the next successful write
        println!("[!] Logged out, but clearing stored credentials failed.");
    }
    Ok(())
}

async fn cmd_whoami(cli: &Cli, config: &Config) -> Result<()> {
    let ctx = connect(cli, config).await?;
    let snapshot = ctx.session.snapshot();

    match &snapshot.session {
        Some(session) => {
            print_user(&session.user);
            Ok(())
        }
        None => {
            println!("Not logged in.");
            Ok(())
        }
    }
}

async fn cmd_auctions(cli: &Cli, config: &Config, command: &AuctionsCommands) -> Result<()> {
    let ctx = connect(cli, config).await?;

    match command {
        AuctionsCommands::List => {
            let auctions = ctx.auctions.list().await?;
            print_auction_table(&auctions);
            Ok(())
        }
        AuctionsCommands::Show { id } => {
            let auction = ctx.auctions.get(*id).await?;
            print_auction(&auction);
            Ok(())
        }
        AuctionsCommands::Mine => {
            let user_id = require_login(&ctx)?;
            let auctions = ctx.auctions.list_by_seller(user_id).await?;
            print_auction_table(&auctions);
            Ok(())
        }
        AuctionsCommands::Create {
            title,
            description,
            starting_price,
            category,
            photo,
        } => {
            require_login(&ctx)?;
            if *starting_price <= 0.0 {
                bail!("Starting price must be positive");
            }
            let new_auction = NewAuction {
                title: title.clone(),
                description: description.clone(),
                starting_price: *starting_price,
                category: category.clone(),
            };
            let paths: Vec<&std::path::Path> = photo.iter().map(PathBuf::as_path).collect();
            let created = ctx.auctions.create(&new_auction, &paths).await?;
            println!("[OK] Auction created with id {}", created.id);
            Ok(())
        }
        AuctionsCommands::Update {
            id,
            title,
            description,
            starting_price,
            category,
            status,
        } => {
            require_login(&ctx)?;
            let update = AuctionUpdate {
                title: title.clone(),
                description: description.clone(),
                starting_price: *starting_price,
                category: category.clone(),
                status: status.clone(),
            };
            let updated = ctx.auctions.update(*id, &update).await?;
            println!("[OK] Auction {} updated", updated.id);
            Ok(())
        }
        AuctionsCommands::Delete { id } => {
            require_login(&ctx)?;
            ctx.auctions.delete(*id).await?;
            println!("[OK] Auction {id} deleted");
            Ok(())
        }
    }
}

async fn cmd_account(cli: &Cli, config: &Config, command: &AccountCommands) -> Result<()> {
    let ctx = connect(cli, config).await?;
    let user_id = require_login(&ctx)?;

    match command {
        AccountCommands::Show => {
            let profile = ctx.users.get(user_id).await?;
            println!();
            println!("ID:        {}", profile.id);
            println!("Email:     {}", profile.email);
            println!("Name:      {} {}",
                profile.firstname.as_deref().unwrap_or("-"),
                profile.lastname.as_deref().unwrap_or("-"));
            if let Some(cin) = profile.cin {
                println!("CIN:       {cin}");
            }
            println!("Photo:     {}",
                if profile.photo_id.is_some() { "set" } else { "none" });
            println!();
            Ok(())
        }
        AccountCommands::Update {
            firstname,
            lastname,
            cin,
            photo,
        } => {
            let update = UserUpdate {
                firstname: firstname.clone(),
                lastname: lastname.clone(),
                cin: *cin,
            };
            let updated = ctx.users.update(user_id, &update, photo.as_deref()).await?;
            println!("[OK] Profile updated for {}", updated.email);
            Ok(())
        }
        AccountCommands::DeletePhoto => {
            ctx.users.delete_photo(user_id).await?;
            println!("[OK] Profile photo removed.");
            Ok(())
        }
    }
}

/// Validate configuration file
async fn cmd_config_check(cli: &Cli) -> Result<()> {
    let config_path = &cli.config;

    println!("Checking configuration file: {}", config_path.display());
    println!();

    if !config_path.exists() {
        println!("[!!] Configuration file not found: {}", config_path.display());
        println!();
        println!("Defaults will be used. To customize, copy mazad.example.toml to mazad.toml");
        return Ok(());
    }

    match Config::load(config_path) {
        Ok(config) => {
            println!("[OK] Configuration file is valid!");
            println!();
            println!("=== Configuration Summary ===");
            println!();
            println!("API:");
            println!("  Base URL:   {}", config.api.base_url);
            println!("  Timeout:    {}s", config.api.timeout_secs);
            println!();
            println!("Storage:");
            println!("  Data Dir:   {}", config.storage.data_dir.display());
            println!();
            println!("Logging:");
            println!("  Level:      {}", config.logging.level);
            println!();
            Ok(())
        }
        Err(e) => {
            println!("[!!] Configuration file is invalid!");
            println!();
            println!("Error: {e}");
            println!();
            anyhow::bail!("Invalid configuration file");
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Logged-in user id, or a friendly error.
fn require_login(ctx: &ClientContext) -> Result<i64> {
    ctx.session
        .snapshot()
        .session
        .as_ref()
        .map(|session| session.user.id)
        .context("Not logged in. Run 'mazad login <email>' first.")
}

lazy_static! {
    /// Loose shape check; the server performs the authoritative validation
    static ref EMAIL_REGEX: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
}

fn validate_email(email: &str) -> Result<(), AuthError> {
    if !EMAIL_REGEX.is_match(email) {
        return Err(AuthError::Validation(format!(
            "'{email}' is not a valid email address"
        )));
    }
    Ok(())
}

fn print_user(user: &crate::store::UserSummary) {
    println!("Email:   {}", user.email);
    println!("Role:    {}", user.role);
    println!("Status:  {}", user.status);
    if let (Some(first), Some(last)) = (&user.firstname, &user.lastname) {
        println!("Name:    {first} {last}");
    }
}

fn print_auction_table(auctions: &[crate::auctions::Auction]) {
    if auctions.is_empty() {
        println!("No auctions found.");
        return;
    }

    println!();
    println!(
        "{:<8}  {:<30}  {:<16}  {:>12}  {:<10}",
        "ID", "TITLE", "CATEGORY", "PRICE", "STATUS"
    );
    println!("{}", "-".repeat(84));

    for auction in auctions {
        println!(
            "{:<8}  {:<30}  {:<16}  {:>12.2}  {:<10}",
            auction.id,
            truncate(&auction.title, 30),
            truncate(auction.category.as_deref().unwrap_or("-"), 16),
            auction.starting_price,
            auction.status.as_deref().unwrap_or("-"),
        );
    }
    println!();
}

fn print_auction(auction: &crate::auctions::Auction) {
    println!();
    println!("=== Auction: {} ===", auction.title);
    println!();
    println!("ID:             {}", auction.id);
    println!("Category:       {}", auction.category.as_deref().unwrap_or("-"));
    println!("Starting price: {:.2}", auction.starting_price);
    println!("Status:         {}", auction.status.as_deref().unwrap_or("-"));
    if let Some(seller) = auction.seller_id {
        println!("Seller:         {seller}");
    }
    if let Some(description) = &auction.description {
        println!();
        println!("{description}");
    }
    println!();
}

/// Truncate a string to at most `max_len` bytes with an ellipsis.
/// Titles come from the server and may be multibyte, so the cut must
/// land on a char boundary.
fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut cut = max_len.saturating_sub(3);
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &s[..cut])
}
