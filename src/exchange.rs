use crate::browser::BrowserLauncher;
use crate::credential::{Credential, CredentialStore};
use crate::error::{Error, Result};
use crate::server::{RedirectListener, RedirectResult};

use oauth2::basic::{BasicClient, BasicErrorResponse};
use oauth2::url::Url;
use oauth2::{
    AuthType, AuthUrl, AuthorizationCode, ClientId, ClientSecret, HttpRequest, HttpResponse,
    RedirectUrl, RequestTokenError, TokenUrl,
};
use std::time::{Duration, SystemTime};

/// Endpoints and listener settings for one authorization-code flow.
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub struct OAuthConfig {
    pub auth_url: String,
    pub token_url: String,
    pub listen_host: String,
    pub listen_port: u16,
    pub redirect_path: String,
    pub redirect_timeout: Duration,
}

impl OAuthConfig {
    /// Default scope requested from Dailymotion.
    pub const DAILYMOTION_SCOPE: &'static str = "read";

    /// Production Dailymotion endpoints, redirect to `http://localhost:8080/`.
    pub fn dailymotion() -> Self {
        OAuthConfig {
            auth_url: "https://api.dailymotion.com/oauth/authorize".to_string(),
            token_url: "https://api.dailymotion.com/oauth/token".to_string(),
            listen_host: "localhost".to_string(),
            listen_port: 8080,
            redirect_path: "/".to_string(),
            redirect_timeout: Duration::from_secs(300),
        }
    }
}

/// The parameters rendered into the browser-facing authorization URL.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct AuthorizationRequest {
    pub client_id: String,
    pub redirect_uri: String,
    pub scope: String,
    pub authorization_endpoint: String,
}

impl AuthorizationRequest {
    /// `{endpoint}?client_id=&redirect_uri=&scope=&response_type=code`
    pub fn to_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.authorization_endpoint).map_err(|_| Error::InvalidUrl)?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", &self.redirect_uri)
            .append_pair("scope", &self.scope)
            .append_pair("response_type", "code");
        Ok(url)
    }

    /// Recovers the request from a URL produced by [`to_url`](Self::to_url).
    pub fn from_url(url: &str) -> Result<Self> {
        let mut url = Url::parse(url).map_err(|_| Error::InvalidUrl)?;

        let mut client_id = None;
        let mut redirect_uri = None;
        let mut scope = None;
        let mut response_type = None;
        let mut rest = Vec::new();
        for (key, value) in url.query_pairs() {
            let value = value.into_owned();
            match key.as_ref() {
                "client_id" => client_id = Some(value),
                "redirect_uri" => redirect_uri = Some(value),
                "scope" => scope = Some(value),
                "response_type" => response_type = Some(value),
                _ => rest.push((key.into_owned(), value)),
            }
        }
        if response_type.as_deref() != Some("code") {
            return Err(Error::InvalidUrl);
        }

        if rest.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(rest);
        }

        Ok(AuthorizationRequest {
            client_id: client_id.ok_or(Error::InvalidUrl)?,
            redirect_uri: redirect_uri.ok_or(Error::InvalidUrl)?,
            scope: scope.ok_or(Error::InvalidUrl)?,
            authorization_endpoint: url.to_string(),
        })
    }
}

/// Builds the blocking client shared by the token exchange and API calls.
/// Redirects are not followed, the token endpoint must answer directly.
pub fn http_client() -> Result<reqwest::blocking::Client> {
    Ok(reqwest::blocking::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()?)
}

/// Drives the authorization-code grant end to end: listener, browser,
/// redirect, token exchange.
pub struct AuthorizationCodeExchanger {
    config: OAuthConfig,
    http: reqwest::blocking::Client,
    browser: Box<dyn BrowserLauncher>,
    store: Option<Box<dyn CredentialStore>>,
}

impl AuthorizationCodeExchanger {
    /// The HTTP client is used for the token call; `browser` shows the
    /// authorization page.
    pub fn new(
        config: OAuthConfig,
        http: reqwest::blocking::Client,
        browser: Box<dyn BrowserLauncher>,
    ) -> Self {
        AuthorizationCodeExchanger {
            config,
            http,
            browser,
            store: None,
        }
    }

    /// Persist credentials from successful exchanges in `store`.
    pub fn with_store(mut self, store: Box<dyn CredentialStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Pure: the same inputs always render the same URL.
    pub fn build_authorization_url(
        &self,
        client_id: &str,
        redirect_uri: &str,
        scope: &str,
    ) -> Result<String> {
        let request = AuthorizationRequest {
            client_id: client_id.to_string(),
            redirect_uri: redirect_uri.to_string(),
            scope: scope.to_string(),
            authorization_endpoint: self.config.auth_url.clone(),
        };
        Ok(request.to_url()?.to_string())
    }

    /// Runs the whole flow. The redirect listener is stopped on every exit
    /// path before this returns.
    pub fn run(&self, client_id: &str, client_secret: &str, scope: &str) -> Result<Credential> {
        let mut listener = RedirectListener::new(&self.config.listen_host, self.config.listen_port)
            .with_path(&self.config.redirect_path);
        listener.start()?;

        let result = self.authorize(&mut listener, client_id, client_secret, scope);
        listener.stop();
        let credential = result?;

        if let Some(store) = &self.store {
            if let Err(e) = store.save(&credential) {
                tracing::warn!("failed to save credential: {}", e);
            }
        }
        Ok(credential)
    }

    fn authorize(
        &self,
        listener: &mut RedirectListener,
        client_id: &str,
        client_secret: &str,
        scope: &str,
    ) -> Result<Credential> {
        let redirect_uri = listener.redirect_uri();
        let auth_url = self.build_authorization_url(client_id, &redirect_uri, scope)?;
        self.launch(&auth_url);

        tracing::info!("waiting for authorization redirect");
        match listener.await_result(self.config.redirect_timeout)? {
            RedirectResult::Code(code) => {
                tracing::info!("authorization code received");
                self.exchange_code(client_id, client_secret, &redirect_uri, code)
            }
            RedirectResult::Error(reason) => {
                tracing::warn!(%reason, "authorization denied");
                Err(Error::AuthorizationDenied { reason })
            }
        }
    }

    fn launch(&self, auth_url: &str) {
        match self.browser.open(auth_url) {
            Ok(()) => tracing::info!("opened authorization page in browser"),
            Err(e) => {
                tracing::debug!("could not open browser: {}", e);
                println!("Open the following address in your favorite browser:");
                println!("  {}", auth_url);
            }
        }
    }

    /// `grant_type=authorization_code` against the token endpoint, with the
    /// client credentials in the request body.
    pub fn exchange_code(
        &self,
        client_id: &str,
        client_secret: &str,
        redirect_uri: &str,
        code: String,
    ) -> Result<Credential> {
        let client = BasicClient::new(
            ClientId::new(client_id.to_string()),
            Some(ClientSecret::new(client_secret.to_string())),
            AuthUrl::new(self.config.auth_url.clone()).map_err(|_| Error::InvalidUrl)?,
            Some(TokenUrl::new(self.config.token_url.clone()).map_err(|_| Error::InvalidUrl)?),
        )
        .set_auth_type(AuthType::RequestBody)
        .set_redirect_uri(
            RedirectUrl::new(redirect_uri.to_string()).map_err(|_| Error::InvalidUrl)?,
        );

        tracing::info!(token_url = %self.config.token_url, "exchanging authorization code");
        let response = client
            .exchange_code(AuthorizationCode::new(code))
            .request(|request| send(&self.http, request))
            .map_err(token_error)?;

        Ok(Credential::from_response(&response, SystemTime::now()))
    }
}

impl std::fmt::Debug for AuthorizationCodeExchanger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationCodeExchanger")
            .field("config", &self.config)
            .field("store", &self.store.is_some())
            .finish()
    }
}

fn send(
    client: &reqwest::blocking::Client,
    request: HttpRequest,
) -> std::result::Result<HttpResponse, reqwest::Error> {
    let mut builder = client
        .request(request.method, request.url.as_str())
        .body(request.body);
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_bytes());
    }

    let response = builder.send()?;
    let status_code = response.status();
    let headers = response.headers().to_owned();
    let body = response.bytes()?.to_vec();

    Ok(HttpResponse {
        status_code,
        headers,
        body,
    })
}

fn token_error(
    err: oauth2::basic::BasicRequestTokenError<reqwest::Error>,
) -> Error {
    match err {
        RequestTokenError::ServerResponse(response) => Error::TokenExchange {
            reason: response.error().to_string(),
            description: response.error_description().cloned(),
        },
        RequestTokenError::Request(e) => Error::Http(e),
        RequestTokenError::Parse(e, body) => {
            // some servers answer 200 with an error document
            match serde_json::from_slice::<BasicErrorResponse>(&body) {
                Ok(response) => Error::TokenExchange {
                    reason: response.error().to_string(),
                    description: response.error_description().cloned(),
                },
                Err(_) => Error::TokenExchange {
                    reason: String::from_utf8_lossy(&body).into_owned(),
                    description: Some(e.to_string()),
                },
            }
        }
        RequestTokenError::Other(reason) => Error::TokenExchange {
            reason,
            description: None,
        },
    }
}
