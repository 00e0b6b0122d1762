use clap::Parser;
use dailymotion_oauth::{
    render_feed, AuthorizationCodeExchanger, BrowserLauncher, Credential, CredentialStore,
    DailymotionClient, FileCredentialStore, OAuthConfig, PrintUrl, SystemBrowser,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Authorize against Dailymotion and list your favorite videos.
#[derive(Debug, Parser)]
#[command(name = "dailymotion-favorites", version, about, long_about = None)]
struct Cli {
    /// OAuth2 client id of the registered application
    #[arg(long, env = "DAILYMOTION_CLIENT_ID", hide_env_values = true)]
    client_id: String,

    /// OAuth2 client secret of the registered application
    #[arg(long, env = "DAILYMOTION_CLIENT_SECRET", hide_env_values = true)]
    client_secret: String,

    #[arg(long, default_value = OAuthConfig::DAILYMOTION_SCOPE)]
    scope: String,

    #[arg(long, default_value = "https://api.dailymotion.com/oauth/authorize")]
    authorization_url: String,

    #[arg(long, default_value = "https://api.dailymotion.com/oauth/token")]
    token_url: String,

    #[arg(long, default_value = DailymotionClient::DEFAULT_BASE_URL)]
    api_url: String,

    /// Host the redirect listener binds to
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Port the redirect listener binds to
    #[arg(long, default_value_t = 8080)]
    port: u16,

    #[arg(long, default_value = "/")]
    redirect_path: String,

    /// Seconds to wait for the authorization redirect
    #[arg(long, default_value_t = 300)]
    timeout: u64,

    /// Reuse and store credentials in this JSON file
    #[arg(long, env = "DAILYMOTION_CREDENTIALS_FILE")]
    credentials_file: Option<PathBuf>,

    /// Browser command to try when the system browser can't be opened
    #[arg(long, default_value = "google-chrome")]
    browser: String,

    /// Print the authorization URL instead of opening a browser
    #[arg(long)]
    no_browser: bool,

    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn oauth_config(&self) -> OAuthConfig {
        OAuthConfig {
            auth_url: self.authorization_url.clone(),
            token_url: self.token_url.clone(),
            listen_host: self.host.clone(),
            listen_port: self.port,
            redirect_path: self.redirect_path.clone(),
            redirect_timeout: Duration::from_secs(self.timeout),
        }
    }

    fn browser(&self) -> Box<dyn BrowserLauncher> {
        if self.no_browser {
            return Box::new(PrintUrl);
        }
        Box::new(SystemBrowser::new().with_fallback_command(&self.browser))
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn stored_credential(store: &FileCredentialStore) -> Option<Credential> {
    match store.load() {
        Ok(Some(credential)) if !credential.is_expired() => {
            tracing::info!(path = %store.path().display(), "using stored credential");
            Some(credential)
        }
        Ok(Some(_)) => {
            tracing::info!("stored credential expired, authorizing again");
            None
        }
        Ok(None) => None,
        Err(e) => {
            tracing::warn!("ignoring unreadable credential file: {}", e);
            None
        }
    }
}

fn run(cli: &Cli) -> dailymotion_oauth::Result<()> {
    let http = dailymotion_oauth::http_client()?;
    let store = cli.credentials_file.clone().map(FileCredentialStore::new);

    let credential = match store.as_ref().and_then(stored_credential) {
        Some(credential) => credential,
        None => {
            let mut exchanger =
                AuthorizationCodeExchanger::new(cli.oauth_config(), http.clone(), cli.browser());
            if let Some(store) = store {
                exchanger = exchanger.with_store(Box::new(store));
            }
            exchanger.run(&cli.client_id, &cli.client_secret, &cli.scope)?
        }
    };

    let client = DailymotionClient::new(http, cli.api_url.clone());
    let feed = client.favorite_videos(&credential)?;
    print!("{}", render_feed(&feed));
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
