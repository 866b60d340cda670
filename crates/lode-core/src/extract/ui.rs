//! Browser-driven report extraction
//!
//! Drives a WebDriver session through the reporting application: login,
//! menu navigation, export-field customization, period selection, download,
//! and a bounded wait for the exported file to land in the download
//! directory. The browser is an external collaborator consumed through the
//! [`BrowserSession`] trait; production uses fantoccini, tests use a
//! scripted fake.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, Local};
use fantoccini::{ClientBuilder, Locator};
use lode_common::{EtlError, Result};
use tracing::{debug, info, warn};

use crate::config::UiSourceConfig;
use crate::context::Window;
use crate::extract::Extractor;
use crate::row::{Row, RowSet, Value};

/// Bound for the opportunistic waits inside the add-field loop. Running out
/// of addable fields is expected, so this stays short.
const FIELD_WAIT: Duration = Duration::from_secs(3);

/// The verbs the export flow needs from a browser.
#[async_trait]
pub trait BrowserSession: Send {
    async fn goto(&mut self, url: &str) -> Result<()>;
    /// Type into the form control with this `name` attribute.
    async fn fill_named(&mut self, name: &str, value: &str) -> Result<()>;
    /// Click the form control with this `name` attribute.
    async fn click_named(&mut self, name: &str) -> Result<()>;
    /// Move the cursor over a link so its submenu unfolds.
    async fn hover_link(&mut self, text: &str) -> Result<()>;
    async fn click_link(&mut self, text: &str) -> Result<()>;
    /// Wait for the element, scroll it into view and click it.
    async fn click(&mut self, xpath: &str) -> Result<()>;
    /// Like [`click`](Self::click) but absence within `within` is `Ok(false)`.
    async fn try_click(&mut self, xpath: &str, within: Duration) -> Result<bool>;
    async fn select_label(&mut self, xpath: &str, label: &str) -> Result<()>;
    async fn select_value(&mut self, xpath: &str, value: &str) -> Result<()>;
    /// Whether the element shows up within the session's wait bound.
    async fn has_element(&mut self, xpath: &str) -> Result<bool>;
    /// Release the session. Idempotent.
    async fn close(&mut self) -> Result<()>;
}

/// fantoccini-backed session against a running WebDriver endpoint.
pub struct WebDriverSession {
    client: Option<fantoccini::Client>,
    wait: Duration,
}

impl WebDriverSession {
    pub async fn connect(
        webdriver_url: &str,
        download_dir: &Path,
        wait: Duration,
    ) -> Result<Self> {
        let caps = serde_json::json!({
            "goog:chromeOptions": {
                "args": [
                    "--headless=new",
                    "--window-size=1920,1080",
                    "--disable-gpu",
                    "--no-sandbox",
                    "--disable-dev-shm-usage",
                    "--disable-notifications",
                    "--disable-extensions",
                    "--ignore-certificate-errors",
                ],
                "prefs": {
                    "download.default_directory": download_dir.to_string_lossy(),
                    "download.prompt_for_download": false,
                    "download.directory_upgrade": true,
                    "safebrowsing.enabled": false,
                }
            }
        });
        let caps = caps
            .as_object()
            .cloned()
            .unwrap_or_default();

        let client = ClientBuilder::native()
            .capabilities(caps)
            .connect(webdriver_url)
            .await
            .map_err(|e| EtlError::Connection(format!("webdriver: {e}")))?;
        client.delete_all_cookies().await.map_err(EtlError::browser)?;

        Ok(Self { client: Some(client), wait })
    }

    fn client(&self) -> Result<&fantoccini::Client> {
        self.client
            .as_ref()
            .ok_or_else(|| EtlError::browser("session already closed"))
    }

    async fn wait_for(&self, locator: Locator<'_>) -> Result<fantoccini::elements::Element> {
        self.client()?
            .wait()
            .at_most(self.wait)
            .for_element(locator)
            .await
            .map_err(EtlError::browser)
    }

    async fn run_on(&self, element: &fantoccini::elements::Element, script: &str) -> Result<()> {
        let arg = serde_json::to_value(element).map_err(EtlError::browser)?;
        self.client()?
            .execute(script, vec![arg])
            .await
            .map_err(EtlError::browser)?;
        Ok(())
    }
}

#[async_trait]
impl BrowserSession for WebDriverSession {
    async fn goto(&mut self, url: &str) -> Result<()> {
        self.client()?.goto(url).await.map_err(EtlError::browser)
    }

    async fn fill_named(&mut self, name: &str, value: &str) -> Result<()> {
        let selector = format!("[name='{name}']");
        let element = self.wait_for(Locator::Css(&selector)).await?;
        element.send_keys(value).await.map_err(EtlError::browser)
    }

    async fn click_named(&mut self, name: &str) -> Result<()> {
        let selector = format!("[name='{name}']");
        let element = self.wait_for(Locator::Css(&selector)).await?;
        element.click().await.map_err(EtlError::browser)
    }

    async fn hover_link(&mut self, text: &str) -> Result<()> {
        let element = self.wait_for(Locator::LinkText(text)).await?;
        self.run_on(
            &element,
            "arguments[0].dispatchEvent(new MouseEvent('mouseover', {bubbles: true}));",
        )
        .await
    }

    async fn click_link(&mut self, text: &str) -> Result<()> {
        let element = self.wait_for(Locator::LinkText(text)).await?;
        element.click().await.map_err(EtlError::browser)
    }

    async fn click(&mut self, xpath: &str) -> Result<()> {
        let element = self.wait_for(Locator::XPath(xpath)).await?;
        self.run_on(
            &element,
            "arguments[0].scrollIntoView({block: 'center', inline: 'center'});",
        )
        .await?;
        element.click().await.map_err(EtlError::browser)
    }

    async fn try_click(&mut self, xpath: &str, within: Duration) -> Result<bool> {
        let found = self
            .client()?
            .wait()
            .at_most(within)
            .for_element(Locator::XPath(xpath))
            .await;
        match found {
            Ok(element) => {
                element.click().await.map_err(EtlError::browser)?;
                Ok(true)
            },
            Err(_) => Ok(false),
        }
    }

    async fn select_label(&mut self, xpath: &str, label: &str) -> Result<()> {
        let element = self.wait_for(Locator::XPath(xpath)).await?;
        element
            .select_by_label(label)
            .await
            .map_err(EtlError::browser)
    }

    async fn select_value(&mut self, xpath: &str, value: &str) -> Result<()> {
        let element = self.wait_for(Locator::XPath(xpath)).await?;
        element
            .select_by_value(value)
            .await
            .map_err(EtlError::browser)
    }

    async fn has_element(&mut self, xpath: &str) -> Result<bool> {
        // Slow pages render controls late; only declare the element absent
        // after the full element-wait bound has elapsed.
        let found = self
            .client()?
            .wait()
            .at_most(self.wait)
            .for_element(Locator::XPath(xpath))
            .await;
        Ok(found.is_ok())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(client) = self.client.take() {
            client.close().await.map_err(EtlError::browser)?;
        }
        Ok(())
    }
}

pub struct UiExtractor {
    config: UiSourceConfig,
}

impl UiExtractor {
    pub fn new(config: UiSourceConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Extractor for UiExtractor {
    async fn extract(&mut self, window: Option<&Window>) -> Result<RowSet> {
        info!(
            app = %self.config.app_url,
            report = %self.config.report.report_type,
            "Extracting report through browser automation"
        );

        let mut session = WebDriverSession::connect(
            &self.config.webdriver_url,
            &self.config.download_dir,
            Duration::from_secs(self.config.wait_secs),
        )
        .await?;

        let outcome = run_export(&mut session, &self.config, window).await;

        // The session is released on every exit path.
        if let Err(close_err) = session.close().await {
            warn!(error = %close_err, "Browser session close failed");
        }

        let file = outcome?;
        parse_report(&file)
    }
}

/// Walk the whole export flow and return the downloaded file.
pub(crate) async fn run_export(
    session: &mut dyn BrowserSession,
    config: &UiSourceConfig,
    window: Option<&Window>,
) -> Result<PathBuf> {
    let report = &config.report;

    session.goto(&config.app_url).await?;
    session.fill_named("username", &config.username).await?;
    session.fill_named("password", &config.password).await?;
    session.click_named("login").await?;

    info!(menu = ?report.menu_path, "Navigating to report");
    let (last, hovered) = report
        .menu_path
        .split_last()
        .ok_or_else(|| EtlError::config("report.menu_path cannot be empty"))?;
    for item in hovered {
        session.hover_link(item).await?;
    }
    session.click_link(last).await?;

    session.click(&report.customize_button).await?;

    info!(bound = report.max_field_adds, "Adding export fields");
    let mut added = 0u32;
    for _ in 0..report.max_field_adds {
        // Running out of addable options terminates the loop, not the run.
        if !session.try_click(&report.field_option, FIELD_WAIT).await? {
            break;
        }
        if !session.try_click(&report.add_field_button, FIELD_WAIT).await? {
            break;
        }
        added += 1;
    }
    debug!(added, "Export fields added");
    session.click(&report.confirm_button).await?;

    if let Some(ref tab) = report.archive_tab {
        session.click(tab).await?;
    }
    if let Some(ref toggle) = report.settings_toggle {
        session.click(toggle).await?;
    }

    if let Some(ref division) = report.division {
        let selector = report
            .division_select
            .as_deref()
            .ok_or_else(|| EtlError::config("report.division requires report.division_select"))?;
        // An absent division dropdown usually means the account lacks the
        // permission, so it is fatal rather than skippable.
        if !session.has_element(selector).await? {
            return Err(EtlError::DivisionSelectorNotFound(selector.to_string()));
        }
        session.select_label(selector, division).await?;
    }

    session
        .select_label(&report.interval_select, &report.interval_label)
        .await?;

    let today = Local::now().date_naive();
    let (start, end) = match window {
        // The end dropdown wants the last included day of a half-open window.
        Some(w) => (
            w.start.date(),
            w.end.date().pred_opt().unwrap_or(w.start.date()),
        ),
        None => (today, today),
    };
    session
        .select_value(&report.start_year_select, &start.year().to_string())
        .await?;
    session
        .select_value(&report.start_month_select, &start.month().to_string())
        .await?;
    session
        .select_value(&report.end_year_select, &end.year().to_string())
        .await?;
    session
        .select_value(&report.end_month_select, &end.month().to_string())
        .await?;

    purge_stale(&config.download_dir, &report.report_type)?;

    session.click(&report.download_button).await?;
    let triggered = Local::now();
    info!("Download triggered, waiting for the export file");

    wait_for_export(
        &config.download_dir,
        &format!(
            "{}_{}_{}_",
            report.report_type,
            triggered.year(),
            triggered.month()
        ),
        config.poll_attempts,
        Duration::from_secs(config.poll_interval_secs),
    )
    .await
}

/// Delete leftovers from earlier runs so the polling wait can never match a
/// stale artifact.
fn purge_stale(dir: &Path, prefix: &str) -> Result<()> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)?;
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if name.to_string_lossy().starts_with(prefix) {
            info!(file = %entry.path().display(), "Removing stale export");
            std::fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

/// Poll the download directory until a file matching `{prefix}*` appears.
async fn wait_for_export(
    dir: &Path,
    prefix: &str,
    attempts: u32,
    interval: Duration,
) -> Result<PathBuf> {
    for attempt in 0..attempts {
        if let Some(path) = find_export(dir, prefix)? {
            info!(file = %path.display(), "Export file found");
            return Ok(path);
        }
        debug!(attempt, "Export file not there yet");
        tokio::time::sleep(interval).await;
    }
    Err(EtlError::ExportTimeout {
        pattern: format!("{prefix}*"),
        waited_secs: u64::from(attempts) * interval.as_secs(),
    })
}

fn find_export(dir: &Path, prefix: &str) -> Result<Option<PathBuf>> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        // In-flight browser downloads carry a temporary suffix.
        if name.starts_with(prefix)
            && !name.ends_with(".crdownload")
            && !name.ends_with(".part")
            && !name.ends_with(".tmp")
        {
            return Ok(Some(entry.path()));
        }
    }
    Ok(None)
}

/// Turn the downloaded report into rows. CSV exports are parsed with their
/// header line as column names; anything else is handed downstream as a
/// single-row file reference for a job-specific transform to pick up.
fn parse_report(path: &Path) -> Result<RowSet> {
    let is_csv = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("csv"))
        .unwrap_or(false);

    if !is_csv {
        let mut set = RowSet::with_columns(vec!["file".to_string()]);
        set.push(vec![Value::Text(path.to_string_lossy().into_owned())])?;
        return Ok(set);
    }

    let mut reader = csv::Reader::from_path(path)
        .map_err(|e| EtlError::Parse(format!("reading {}: {e}", path.display())))?;
    let columns: Vec<String> = reader
        .headers()
        .map_err(|e| EtlError::Parse(e.to_string()))?
        .iter()
        .map(str::to_string)
        .collect();

    let mut set = RowSet::with_columns(columns);
    for record in reader.records() {
        let record = record.map_err(|e| EtlError::Parse(e.to_string()))?;
        let row: Row = record
            .iter()
            .map(|field| Value::Text(field.to_string()))
            .collect();
        set.push(row)?;
    }
    Ok(set)
}
