#![warn(missing_docs)]
//! The OAuth2 "installed application" authorization-code flow against
//! Dailymotion, built on [oauth2-rs](https://docs.rs/oauth2/).
//!
//! A [`RedirectListener`] catches the authorization server's redirect on a
//! loopback address while the [`AuthorizationCodeExchanger`] sends the user to
//! the authorization page and trades the returned code for a [`Credential`].
//! ```rust,no_run
//! # fn main() -> Result<(), dailymotion_oauth::Error> {
//! use dailymotion_oauth::{AuthorizationCodeExchanger, OAuthConfig, SystemBrowser};
//!
//! let http = dailymotion_oauth::http_client()?;
//! let exchanger = AuthorizationCodeExchanger::new(
//!     OAuthConfig::dailymotion(),
//!     http.clone(),
//!     Box::new(SystemBrowser::new()),
//! );
//! let credential = exchanger.run("<client id>", "<client secret>", "read")?;
//!
//! let client = dailymotion_oauth::DailymotionClient::new(
//!     http,
//!     dailymotion_oauth::DailymotionClient::DEFAULT_BASE_URL,
//! );
//! let feed = client.favorite_videos(&credential)?;
//! print!("{}", dailymotion_oauth::render_feed(&feed));
//! # Ok(())
//! # }
//! ```

mod browser;
mod credential;
mod dailymotion;
mod error;
mod exchange;
mod server;

pub use browser::{BrowserLauncher, PrintUrl, SystemBrowser};
pub use credential::{Credential, CredentialStore, FileCredentialStore};
pub use dailymotion::{render_feed, DailymotionClient, Video, VideoFeed};
pub use error::{Error, Result};
pub use exchange::{http_client, AuthorizationCodeExchanger, AuthorizationRequest, OAuthConfig};
pub use server::{RedirectListener, RedirectResult};
