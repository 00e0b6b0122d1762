use std::io;
use std::process::{Command, ExitStatus};
use std::thread::JoinHandle;

/// Something that can show the authorization page to the user.
pub trait BrowserLauncher {
    /// An error makes the caller print `url` for the user instead.
    fn open(&self, url: &str) -> io::Result<()>;
}

/// Opens the system default browser, falling back to a named browser
/// command (e.g. `google-chrome`) if one is configured.
#[derive(Debug, Clone, Default)]
pub struct SystemBrowser {
    fallback_command: Option<String>,
}

impl SystemBrowser {
    /// System default browser only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `command <url>` when the system browser can't be opened.
    pub fn with_fallback_command(mut self, command: impl Into<String>) -> Self {
        self.fallback_command = Some(command.into());
        self
    }
}

impl BrowserLauncher for SystemBrowser {
    fn open(&self, url: &str) -> io::Result<()> {
        let err = match webbrowser::open(url) {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        match &self.fallback_command {
            Some(command) => {
                tracing::debug!("system browser unavailable ({}), trying {}", err, command);
                launch_command(command, url).map(drop)
            }
            None => Err(err),
        }
    }
}

/// Spawns `command <url>` and reaps it on a background thread once it exits.
fn launch_command(command: &str, url: &str) -> io::Result<JoinHandle<io::Result<ExitStatus>>> {
    let mut child = Command::new(command).arg(url).spawn()?;
    std::thread::Builder::new()
        .name("browser-reaper".into())
        .spawn(move || child.wait())
}

/// Never launches anything; the caller prints the URL instead.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrintUrl;

impl BrowserLauncher for PrintUrl {
    fn open(&self, _url: &str) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "browser launching disabled",
        ))
    }
}
