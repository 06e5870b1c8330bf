//! Session module.
//!
//! This module contains the RT session: a blocking HTTP client with a
//! persistent cookie jar, the login handshake, and the `fetch_rest`
//! entry point every download goes through.

use log::{debug, trace};
use regex::Regex;
use reqwest::blocking::Client;
use reqwest_cookie_store::{CookieStore, CookieStoreMutex};
use std::{
    fs::{self, File},
    io::{self, BufReader, BufWriter},
    path::PathBuf,
    result,
    sync::Arc,
};
use thiserror::Error;

use crate::{
    config,
    response::{parse_rt_response, RtResponse, RtResponseData},
    RtConfig,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot build http client")]
    BuildClientError(#[source] reqwest::Error),
    #[error("cannot read CA certificate {1}")]
    ReadCaCertError(#[source] io::Error, PathBuf),
    #[error("cannot parse CA certificate {1}")]
    ParseCaCertError(#[source] reqwest::Error, PathBuf),
    #[error("cannot load cookies from {1}: {0}")]
    LoadCookiesError(String, PathBuf),
    #[error("cannot create cookie file {1}")]
    CreateCookieFileError(#[source] io::Error, PathBuf),
    #[error("cannot save cookies to {1}: {0}")]
    SaveCookiesError(String, PathBuf),
    #[error("cannot send request to {1}")]
    SendRequestError(#[source] reqwest::Error, String),
    #[error("cannot read response body from {1}")]
    ReadResponseBodyError(#[source] reqwest::Error, String),
    #[error("cannot probe authorization: unexpected http status {0} from {1}")]
    ProbeStatusError(u16, String),
    #[error("cannot authenticate: login endpoint returned http status {0}")]
    AuthenticationFailedError(u16),
    #[error("cannot read configuration")]
    ConfigError(#[source] config::Error),
    #[error("cannot decode RT response")]
    ResponseError(#[source] crate::response::Error),
}

pub type Result<T> = result::Result<T, Error>;

/// Issues GET requests against the REST interface and decodes the
/// envelope. The downloader is generic over this seam so it can be
/// driven by canned responses in tests.
pub trait FetchRest {
    fn fetch_rest(&self, parts: &[&str]) -> Result<RtResponseData>;
}

impl<T: FetchRest + ?Sized> FetchRest for &T {
    fn fetch_rest(&self, parts: &[&str]) -> Result<RtResponseData> {
        (**self).fetch_rest(parts)
    }
}

/// Represents an authenticated session against one RT server.
///
/// Cookies are loaded at construction (a missing file is an empty
/// jar, not an error) and written back after every successful login,
/// session-only and expired cookies included: the tool's lifetime is
/// decoupled from a browser-style session lifetime.
pub struct RtSession {
    config: RtConfig,
    client: Client,
    cookie_store: Arc<CookieStoreMutex>,
    cookie_file: PathBuf,
}

impl RtSession {
    pub fn new(config: RtConfig) -> Result<Self> {
        let cookie_file: PathBuf = config.cookie_file().map_err(Error::ConfigError)?;

        let cookie_store = match File::open(&cookie_file) {
            Ok(file) => {
                debug!("loading cookies from {:?}", cookie_file);
                CookieStore::load_json_all(BufReader::new(file))
                    .map_err(|err| Error::LoadCookiesError(err.to_string(), cookie_file.clone()))?
            }
            Err(_) => {
                debug!("cookie file {:?} not found, starting with empty jar", cookie_file);
                CookieStore::default()
            }
        };
        let cookie_store = Arc::new(CookieStoreMutex::new(cookie_store));

        let mut builder = Client::builder()
            .cookie_provider(Arc::clone(&cookie_store))
            .timeout(config.timeout);

        if let Some(ca_cert) = &config.ca_cert {
            let pem = fs::read(ca_cert)
                .map_err(|err| Error::ReadCaCertError(err, ca_cert.clone()))?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|err| Error::ParseCaCertError(err, ca_cert.clone()))?;
            builder = builder.add_root_certificate(cert);
        }

        let client = builder.build().map_err(Error::BuildClientError)?;

        Ok(Self {
            config,
            client,
            cookie_store,
            cookie_file,
        })
    }

    /// Performs a GET request and captures the response as a plain
    /// value, cut loose from the HTTP client's own response type.
    pub fn get(&self, url: &str) -> Result<RtResponse> {
        trace!(">> GET {}", url);

        let response = self
            .client
            .get(url)
            .send()
            .map_err(|err| Error::SendRequestError(err, url.to_owned()))?;
        let status_code = response.status().as_u16();
        let final_url = response.url().to_string();
        let content = response
            .bytes()
            .map_err(|err| Error::ReadResponseBodyError(err, url.to_owned()))?
            .to_vec();

        trace!("<< GET {}: http {}", final_url, status_code);
        Ok(RtResponse {
            url: final_url,
            status_code,
            content,
        })
    }

    /// Checks whether the session is already authorized. This is a
    /// side-effect-free probe, safe to call repeatedly.
    pub fn check_authorized(&self) -> Result<bool> {
        let url = self.rest_url(&[]);
        let response = self.get(&url)?;
        if response.status_code >= 400 {
            return Err(Error::ProbeStatusError(response.status_code, response.url));
        }
        let body = String::from_utf8_lossy(&response.content);
        Ok(is_authorized_banner(&body))
    }

    /// Authenticates against RT if not already authenticated: fetches
    /// the password through the configured external command, posts
    /// the login form and persists the resulting cookies. There is no
    /// recovery path from a failed login without a human re-entering
    /// credentials, so callers treat the error as fatal.
    pub fn authenticate(&self) -> Result<()> {
        if self.check_authorized()? {
            debug!("session already authorized");
            return Ok(());
        }
        let password = self.config.password().map_err(Error::ConfigError)?;
        self.fetch_and_save_auth_cookie(&self.config.user, &password)
    }

    /// Posts the login form and saves the authentication cookies.
    pub fn fetch_and_save_auth_cookie(&self, user: &str, password: &str) -> Result<()> {
        let form = [("user", user), ("pass", password)];
        let response = self
            .client
            .post(&self.config.base_url)
            .form(&form)
            .send()
            .map_err(|err| Error::SendRequestError(err, self.config.base_url.clone()))?;

        if !response.status().is_success() {
            return Err(Error::AuthenticationFailedError(response.status().as_u16()));
        }

        self.save_cookies()
    }

    /// Logs out from RT and clears the persisted cookies.
    pub fn logout(&self) -> Result<()> {
        let url = self.rest_url(&["logout"]);
        let response = self.get(&url)?;
        debug!("logout returned http {}", response.status_code);

        self.cookie_store
            .lock()
            .map_err(|err| Error::SaveCookiesError(err.to_string(), self.cookie_file.clone()))?
            .clear();
        self.save_cookies()
    }

    /// Persists the cookie jar, expired and session-only cookies
    /// included.
    pub fn save_cookies(&self) -> Result<()> {
        if let Some(dir) = self.cookie_file.parent() {
            fs::create_dir_all(dir)
                .map_err(|err| Error::CreateCookieFileError(err, self.cookie_file.clone()))?;
        }
        let file = File::create(&self.cookie_file)
            .map_err(|err| Error::CreateCookieFileError(err, self.cookie_file.clone()))?;
        let mut writer = BufWriter::new(file);

        self.cookie_store
            .lock()
            .map_err(|err| Error::SaveCookiesError(err.to_string(), self.cookie_file.clone()))?
            .save_incl_expired_and_nonpersistent_json(&mut writer)
            .map_err(|err| Error::SaveCookiesError(err.to_string(), self.cookie_file.clone()))?;

        debug!("saved cookies to {:?}", self.cookie_file);
        Ok(())
    }

    /// Generates a REST interface URL from path segments.
    pub fn rest_url(&self, parts: &[&str]) -> String {
        let mut segments = vec![
            self.config.base_url.trim_end_matches('/'),
            self.config.rest_path.trim_matches('/'),
        ];
        segments.extend(parts);
        segments.join("/")
    }

    /// Generates a ticket URL with optional additional path segments.
    pub fn ticket_url(&self, ticket_id: &str, parts: &[&str]) -> String {
        let mut segments = vec!["ticket", ticket_id];
        segments.extend(parts);
        self.rest_url(&segments)
    }
}

impl FetchRest for RtSession {
    /// GETs a REST URL built from the given segments and decodes the
    /// envelope. Whether the trailing triple-newline terminator must
    /// be stripped is derived here, from the request itself, and
    /// handed to the parser explicitly.
    fn fetch_rest(&self, parts: &[&str]) -> Result<RtResponseData> {
        let url = self.rest_url(parts);
        let is_content_endpoint = parts.last().map(|part| *part == "content").unwrap_or(false);
        let response = self.get(&url)?;
        parse_rt_response(&response, is_content_endpoint).map_err(Error::ResponseError)
    }
}

/// Tests a response body against the authorized-session banner.
fn is_authorized_banner(body: &str) -> bool {
    Regex::new(r"(?i)^rt/[.0-9]+\s+200\s+ok")
        .unwrap()
        .is_match(body)
}

#[cfg(test)]
mod test_rt_session {
    use cookie::Cookie as RawCookie;

    use crate::RtConfig;

    use super::{is_authorized_banner, RtSession};

    fn new_session(cookie_file: &str) -> RtSession {
        RtSession::new(RtConfig {
            base_url: "https://rt.example.com".into(),
            user: "tester".into(),
            cookie_file: cookie_file.into(),
            ..RtConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_rest_url() {
        let session = new_session("cookies.json");

        assert_eq!("https://rt.example.com/REST/1.0", session.rest_url(&[]));
        assert_eq!(
            "https://rt.example.com/REST/1.0/ticket/123/history",
            session.rest_url(&["ticket", "123", "history"]),
        );
    }

    #[test]
    fn test_ticket_url() {
        let session = new_session("cookies.json");

        assert_eq!(
            "https://rt.example.com/REST/1.0/ticket/37525/attachments/456/content",
            session.ticket_url("37525", &["attachments", "456", "content"]),
        );
    }

    #[test]
    fn test_authorized_banner() {
        assert!(is_authorized_banner("RT/4.4.3 200 Ok\n\n"));
        assert!(is_authorized_banner("rt/5.0.1 200 OK\n\nsome body"));
        assert!(!is_authorized_banner("RT/4.4.3 401 Credentials required\n\n"));
        assert!(!is_authorized_banner("<html>login page</html>"));
    }

    #[test]
    fn test_missing_cookie_file_is_an_empty_jar() {
        let dir = tempfile::tempdir().unwrap();
        let cookie_file = dir.path().join("cookies.json");

        let session = new_session(cookie_file.to_str().unwrap());
        assert!(!cookie_file.exists());

        session.save_cookies().unwrap();
        assert!(cookie_file.exists());

        // reload what was just saved
        let _ = new_session(cookie_file.to_str().unwrap());
    }

    #[test]
    fn test_session_only_cookies_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let cookie_file = dir.path().join("cookies.json");
        let url = reqwest::Url::parse("https://rt.example.com").unwrap();

        let session = new_session(cookie_file.to_str().unwrap());
        session
            .cookie_store
            .lock()
            .unwrap()
            // no Expires and no Max-Age, so a browser would discard it
            .insert_raw(&RawCookie::parse("RT_SID=abc123").unwrap(), &url)
            .unwrap();
        session.save_cookies().unwrap();

        let reloaded = new_session(cookie_file.to_str().unwrap());
        let store = reloaded.cookie_store.lock().unwrap();
        assert!(store.get("rt.example.com", "/", "RT_SID").is_some());
    }
}
