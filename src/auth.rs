//! OAuth 2.0 device authorization grant against the Microsoft identity
//! platform.

use std::thread;
use std::time::Duration;
use std::time::Instant;

use anyhow::bail;
use arboard::Clipboard;
use serde::Deserialize;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::browser::open_in_browser;

const AUTHORITY_URL: &str = "https://login.microsoftonline.com";
const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";
const DEFAULT_SCOPES: &str = "Team.ReadBasic.All Files.Read.All";
/// Added to the polling interval on every `slow_down` reply.
const SLOW_DOWN_SECS: u64 = 5;

/// What the user needs to complete sign-in in a browser.
#[derive(Debug, Deserialize)]
pub struct DeviceCodeChallenge {
    pub user_code: String,
    pub verification_uri: String,
    /// Ready-made instruction text from the identity platform.
    pub message: String,
    device_code: String,
    expires_in: u64,
    #[serde(default = "default_interval")]
    interval: u64,
}

fn default_interval() -> u64 {
    5
}

#[derive(Debug, Deserialize)]
struct TokenResp {
    access_token: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

#[derive(Debug)]
pub struct DeviceCodeFlow {
    authority: String,
    tenant: String,
    client_id: String,
    scopes: String,
}

impl DeviceCodeFlow {
    pub fn new<S: Into<String>>(client_id: S) -> Self {
        Self {
            authority: String::from(AUTHORITY_URL),
            tenant: String::from("organizations"),
            client_id: client_id.into(),
            scopes: String::from(DEFAULT_SCOPES),
        }
    }

    pub fn authority<S: Into<String>>(mut self, authority: S) -> Self {
        self.authority = authority.into();
        self
    }

    pub fn tenant<S: Into<String>>(mut self, tenant: S) -> Self {
        self.tenant = tenant.into();
        self
    }

    /// Runs the flow to completion and returns an access token. `present` is
    /// called once with the challenge before polling starts.
    pub fn authenticate<F>(&self, present: F) -> anyhow::Result<String>
    where
        F: FnOnce(&DeviceCodeChallenge),
    {
        let resp = attohttpc::post(self.endpoint("devicecode"))
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("scope", self.scopes.as_str()),
            ])?
            .send()?;
        if !resp.is_success() {
            let status = resp.status();
            let body: TokenResp = resp.json_utf8()?;
            bail!(
                "Failed to request a device code ({}): {}",
                status,
                describe(&body)
            );
        }
        let challenge: DeviceCodeChallenge = resp.json_utf8()?;

        present(&challenge);
        self.poll(&challenge)
    }

    fn poll(&self, challenge: &DeviceCodeChallenge) -> anyhow::Result<String> {
        let deadline = Instant::now() + Duration::from_secs(challenge.expires_in);
        let mut interval = challenge.interval;

        loop {
            if Instant::now() >= deadline {
                bail!("The device code expired before sign-in completed");
            }

            let body: TokenResp = attohttpc::post(self.endpoint("token"))
                .form(&[
                    ("grant_type", DEVICE_CODE_GRANT),
                    ("client_id", self.client_id.as_str()),
                    ("device_code", challenge.device_code.as_str()),
                ])?
                .send()?
                .json_utf8()?;

            if let Some(token) = body.access_token {
                return Ok(token);
            }

            match body.error.as_deref() {
                Some("authorization_pending") => debug!("Waiting for sign-in"),
                Some("slow_down") => interval += SLOW_DOWN_SECS,
                _ => bail!("Sign-in failed: {}", describe(&body)),
            }
            thread::sleep(Duration::from_secs(interval));
        }
    }

    fn endpoint(&self, name: &str) -> String {
        format!(
            "{}/{}/oauth2/v2.0/{}",
            self.authority.trim_end_matches('/'),
            self.tenant,
            name
        )
    }
}

/// Shows the challenge to the user: prints the instructions, copies the
/// code and opens the verification page. Clipboard and browser failures
/// only warn.
pub fn present_challenge(
    challenge: &DeviceCodeChallenge,
    clipboard: Option<&mut Clipboard>,
    open_browser: bool,
) {
    println!("{}", challenge.message);
    if let Some(clipboard) = clipboard {
        match clipboard.set_text(challenge.user_code.as_str()) {
            Ok(()) => info!("Copied the code to the clipboard"),
            Err(err) => warn!(error = %err, "Failed to copy the code to the clipboard"),
        }
    }
    if open_browser {
        if let Err(err) = open_in_browser(&challenge.verification_uri) {
            warn!(error = %err, "Failed to open a browser");
        }
    }
}

fn describe(body: &TokenResp) -> String {
    format!(
        "{}: {}",
        body.error.as_deref().unwrap_or("unknown_error"),
        body.error_description.as_deref().unwrap_or("no description")
    )
}
