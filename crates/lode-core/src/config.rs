//! Job configuration
//!
//! One TOML file describes one ETL job: the warehouse target, the
//! idempotency key discipline, and exactly one source. Everything is
//! validated at construction; unknown fields and unknown source types are
//! rejected before any connection is opened.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use lode_common::{EtlError, Result};
use serde::{Deserialize, Serialize};

/// Default warehouse port.
pub const DEFAULT_WAREHOUSE_PORT: u16 = 5432;

/// Default MSSQL source port.
pub const DEFAULT_SOURCE_PORT: u16 = 1433;

/// One ETL job, immutable for the duration of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobConfig {
    /// Job name. Doubles as the warehouse table name and the SQL template
    /// file stem unless overridden.
    pub name: String,

    pub warehouse: WarehouseConfig,

    /// Target table; defaults to `name`.
    #[serde(default)]
    pub table: Option<String>,

    /// Idempotency key discipline. Defaults to a `period` window.
    #[serde(default)]
    pub key: KeyConfig,

    /// Shift the derived calendar window this many months into the past.
    #[serde(default)]
    pub month_offset: u32,

    /// Explicit window overriding any scheduler-derived one.
    #[serde(default)]
    pub window: Option<ExplicitWindow>,

    pub source: SourceConfig,
}

impl JobConfig {
    /// Load and validate a job definition, with `LODE_`-prefixed environment
    /// variables overriding file values (secrets usually arrive this way).
    pub fn from_file(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("LODE").separator("__"))
            .build()
            .map_err(map_config_err)?;
        let job: JobConfig = settings.try_deserialize().map_err(map_config_err)?;
        job.validate()?;
        Ok(job)
    }

    /// Parse a job definition from TOML text (tests, embedding).
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .build()
            .map_err(map_config_err)?;
        let job: JobConfig = settings.try_deserialize().map_err(map_config_err)?;
        job.validate()?;
        Ok(job)
    }

    /// Target table name (unqualified).
    pub fn table(&self) -> &str {
        self.table.as_deref().unwrap_or(&self.name)
    }

    /// `{schema}.{table}` address of the target table.
    pub fn qualified_table(&self) -> String {
        format!("{}.{}", self.warehouse.schema, self.table())
    }

    /// Whether the job is scoped to a period window.
    pub fn is_periodic(&self) -> bool {
        matches!(self.key, KeyConfig::Period { .. })
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(EtlError::config("job name cannot be empty"));
        }
        self.warehouse.validate()?;
        if let Some(ref w) = self.window {
            if w.start >= w.end {
                return Err(EtlError::WatermarkOrder { min: w.start, max: w.end });
            }
        }
        match &self.source {
            SourceConfig::Sql(cfg) => cfg.validate(),
            SourceConfig::RestApi(cfg) => cfg.validate(),
            SourceConfig::Ui(cfg) => cfg.validate(),
        }
    }
}

fn map_config_err(err: config::ConfigError) -> EtlError {
    let msg = err.to_string();
    if msg.contains("unknown variant") {
        EtlError::UnsupportedSourceType(msg)
    } else {
        EtlError::Config(msg)
    }
}

/// Warehouse (PostgreSQL) connection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WarehouseConfig {
    pub host: String,
    #[serde(default = "default_warehouse_port")]
    pub port: u16,
    pub database: String,
    pub schema: String,
    pub user: String,
    pub password: String,
}

impl WarehouseConfig {
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("warehouse.host", &self.host),
            ("warehouse.database", &self.database),
            ("warehouse.schema", &self.schema),
            ("warehouse.user", &self.user),
        ] {
            if value.is_empty() {
                return Err(EtlError::config(format!("{field} cannot be empty")));
            }
        }
        Ok(())
    }
}

fn default_warehouse_port() -> u16 {
    DEFAULT_WAREHOUSE_PORT
}

/// Explicit `[start, end)` window supplied in the job definition.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExplicitWindow {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

/// Which rows a rerun replaces.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum KeyConfig {
    /// Delete/recount by a half-open period window on `column`.
    Period { column: String },
    /// Delete/recount by the id values found in the extracted rows.
    Ids {
        column: String,
        /// Zero-based position of the id value within each extracted row.
        position: usize,
    },
    /// Replace the whole table.
    Full,
}

// Hand-written so the key table rejects unknown and mode-foreign fields.
// An internally tagged derive would silently drop them, and a stray
// `month_offset` landing under `[key]` must fail loudly, not change which
// month the job replaces.
impl<'de> Deserialize<'de> for KeyConfig {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error as _;

        #[derive(Deserialize)]
        #[serde(deny_unknown_fields)]
        struct KeyTable {
            mode: String,
            #[serde(default)]
            column: Option<String>,
            #[serde(default)]
            position: Option<usize>,
        }

        let table = KeyTable::deserialize(deserializer)?;
        match table.mode.as_str() {
            "period" => {
                if table.position.is_some() {
                    return Err(D::Error::custom(
                        "key.position is only valid for mode = \"ids\"",
                    ));
                }
                Ok(KeyConfig::Period {
                    column: table.column.unwrap_or_else(default_period_column),
                })
            },
            "ids" => Ok(KeyConfig::Ids {
                column: table
                    .column
                    .ok_or_else(|| D::Error::custom("key mode \"ids\" requires key.column"))?,
                position: table.position.unwrap_or(0),
            }),
            "full" => {
                if table.column.is_some() || table.position.is_some() {
                    return Err(D::Error::custom(
                        "key mode \"full\" takes no column or position",
                    ));
                }
                Ok(KeyConfig::Full)
            },
            other => Err(D::Error::custom(format!("unknown key mode '{other}'"))),
        }
    }
}

impl Default for KeyConfig {
    fn default() -> Self {
        KeyConfig::Period { column: default_period_column() }
    }
}

fn default_period_column() -> String {
    "period".to_string()
}

/// The source a job extracts from. Closed set; an unknown `type` tag fails
/// configuration parsing with [`EtlError::UnsupportedSourceType`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceConfig {
    Sql(SqlSourceConfig),
    RestApi(RestSourceConfig),
    Ui(UiSourceConfig),
}

impl SourceConfig {
    /// Discriminator name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            SourceConfig::Sql(_) => "sql",
            SourceConfig::RestApi(_) => "rest_api",
            SourceConfig::Ui(_) => "ui",
        }
    }
}

/// How the SQL strategy shapes its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SqlOutputMode {
    /// Native row tuples from the driver cursor.
    #[default]
    Rows,
    /// The whole result set serialized as one single-column JSON document.
    Json,
}

/// MSSQL source parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SqlSourceConfig {
    pub host: String,
    #[serde(default = "default_source_port")]
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,

    /// ODBC driver identifier carried in the connection descriptor.
    /// Defaults by host OS; override for non-standard driver installs.
    #[serde(default)]
    pub driver: Option<String>,

    /// Directory holding the `{name}.sql` query template.
    pub script_dir: PathBuf,

    /// Source table substituted for `{source_table_name}`.
    #[serde(default)]
    pub source_table: Option<String>,

    /// Timestamp column governing incrementality. When set, the run window
    /// comes from the warehouse high watermark.
    #[serde(default)]
    pub ts_field: Option<String>,

    #[serde(default)]
    pub mode: SqlOutputMode,
}

impl SqlSourceConfig {
    /// OS-selected ODBC driver identifier unless the job overrides it.
    pub fn driver_name(&self) -> String {
        self.driver.clone().unwrap_or_else(default_driver_for_os)
    }

    /// ODBC-form connection descriptor, logged before connecting. Password
    /// is withheld.
    pub fn connection_descriptor(&self) -> String {
        format!(
            "DRIVER={{{}}};SERVER={},{};DATABASE={};ENCRYPT=no;UID={}",
            self.driver_name(),
            self.host,
            self.port,
            self.database,
            self.user,
        )
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(EtlError::config("source.host cannot be empty"));
        }
        if self.script_dir.as_os_str().is_empty() {
            return Err(EtlError::config("source.script_dir cannot be empty"));
        }
        Ok(())
    }
}

/// Driver identifier by host OS. Exposed so deployments can assert what a
/// job will advertise.
pub fn default_driver_for_os() -> String {
    if cfg!(windows) {
        "SQL Server".to_string()
    } else {
        "ODBC Driver 18 for SQL Server".to_string()
    }
}

fn default_source_port() -> u16 {
    DEFAULT_SOURCE_PORT
}

/// Basic-auth credentials for a REST source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

/// JSON flattening parameters.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct JsonNormalizeSpec {
    /// Top-level key to descend into before anything else.
    #[serde(default)]
    pub json_key: Option<String>,
    /// Dot-separated path to the record array within each parent object.
    #[serde(default)]
    pub record_path: Option<String>,
    /// Parent-level fields appended to every record row.
    #[serde(default)]
    pub meta: Vec<String>,
    /// Prefix for meta column names.
    #[serde(default)]
    pub meta_prefix: Option<String>,
}

/// XML flattening parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct XmlNormalizeSpec {
    /// `//element` selector; one row per matched node.
    pub xpath: String,
}

/// REST API source parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RestSourceConfig {
    pub endpoint: String,
    #[serde(default = "default_http_method")]
    pub method: String,
    #[serde(default)]
    pub auth: Option<BasicAuth>,

    /// Query parameters as a map. Takes precedence over `params_str`.
    #[serde(default)]
    pub params: Option<BTreeMap<String, String>>,
    /// Raw parameter-string template, e.g.
    /// `?changed=gte.{start_date}&changed=lt.{end_date}`.
    #[serde(default)]
    pub params_str: Option<String>,

    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Request body template; `{start_date}`/`{end_date}` are substituted.
    #[serde(default)]
    pub body: Option<String>,

    #[serde(default)]
    pub json_normalize: Option<JsonNormalizeSpec>,
    #[serde(default)]
    pub xml_normalize: Option<XmlNormalizeSpec>,

    /// Skip TLS certificate verification. Off by default.
    #[serde(default)]
    pub insecure_tls: bool,

    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
}

impl RestSourceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.is_empty() {
            return Err(EtlError::config("source.endpoint cannot be empty"));
        }
        const METHODS: [&str; 5] = ["get", "post", "put", "patch", "delete"];
        if !METHODS.contains(&self.method.to_lowercase().as_str()) {
            return Err(EtlError::config(format!(
                "source.method must be one of {METHODS:?}, got '{}'",
                self.method
            )));
        }
        Ok(())
    }
}

fn default_http_method() -> String {
    "get".to_string()
}

fn default_http_timeout_secs() -> u64 {
    300
}

/// Browser-automation source parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UiSourceConfig {
    /// Running WebDriver endpoint, e.g. `http://localhost:9515`.
    pub webdriver_url: String,
    /// Reporting application URL with the login form.
    pub app_url: String,
    pub username: String,
    pub password: String,
    /// Directory the browser downloads into.
    pub download_dir: PathBuf,
    pub report: ReportFlow,

    /// Attempts while polling for the exported file.
    #[serde(default = "default_poll_attempts")]
    pub poll_attempts: u32,
    /// Seconds between polling attempts.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Element-wait bound in seconds.
    #[serde(default = "default_wait_secs")]
    pub wait_secs: u64,
}

impl UiSourceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.webdriver_url.is_empty() || self.app_url.is_empty() {
            return Err(EtlError::config(
                "source.webdriver_url and source.app_url cannot be empty",
            ));
        }
        if self.poll_attempts == 0 {
            return Err(EtlError::config("source.poll_attempts must be > 0"));
        }
        if self.report.division.is_some() && self.report.division_select.is_none() {
            return Err(EtlError::config(
                "report.division requires report.division_select",
            ));
        }
        if self.report.menu_path.is_empty() {
            return Err(EtlError::config("report.menu_path cannot be empty"));
        }
        Ok(())
    }
}

/// DOM waypoints of one report export flow. XPaths and link texts are part
/// of the job definition because the target application is external and its
/// structure changes without notice.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReportFlow {
    /// Exported file name prefix, e.g. `Obracsheniya`.
    pub report_type: String,
    /// Link texts walked through the menu, hover then click.
    pub menu_path: Vec<String>,

    /// Gear button opening the export-field customizer.
    pub customize_button: String,
    /// First addable option inside the customizer.
    pub field_option: String,
    pub add_field_button: String,
    pub confirm_button: String,
    /// Upper bound of the add-field loop; running out of addable fields
    /// earlier is the normal termination.
    #[serde(default = "default_max_field_adds")]
    pub max_field_adds: u32,

    /// Optional archive tab clicked after field customization.
    #[serde(default)]
    pub archive_tab: Option<String>,
    /// Optional toggle expanding the report settings panel.
    #[serde(default)]
    pub settings_toggle: Option<String>,

    pub interval_select: String,
    /// Visible label for the month-interval option.
    #[serde(default = "default_interval_label")]
    pub interval_label: String,

    pub start_year_select: String,
    pub start_month_select: String,
    pub end_year_select: String,
    pub end_month_select: String,

    pub download_button: String,

    /// Division label to pick; its dropdown being absent is a fatal
    /// permissions signal, not a skippable step.
    #[serde(default)]
    pub division: Option<String>,
    #[serde(default)]
    pub division_select: Option<String>,
}

fn default_max_field_adds() -> u32 {
    10
}

fn default_interval_label() -> String {
    "МС".to_string()
}

fn default_poll_attempts() -> u32 {
    36
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_wait_secs() -> u64 {
    20
}

#[cfg(test)]
mod tests {
    use super::*;

    const SQL_JOB: &str = r#"
        name = "dealer_requests"

        [warehouse]
        host = "dwh.internal"
        database = "analytics"
        schema = "stage"
        user = "etl"
        password = "secret"

        [key]
        mode = "ids"
        column = "request_id"

        [source]
        type = "sql"
        host = "mssql.internal"
        database = "crm"
        user = "reader"
        password = "secret"
        script_dir = "./jobs/sql"
        source_table = "dbo.requests"
        ts_field = "updated_at"
    "#;

    #[test]
    fn test_parse_sql_job() {
        let job = JobConfig::from_toml_str(SQL_JOB).unwrap();
        assert_eq!(job.name, "dealer_requests");
        assert_eq!(job.warehouse.port, DEFAULT_WAREHOUSE_PORT);
        assert_eq!(job.qualified_table(), "stage.dealer_requests");
        assert!(!job.is_periodic());
        match &job.source {
            SourceConfig::Sql(cfg) => {
                assert_eq!(cfg.port, DEFAULT_SOURCE_PORT);
                assert_eq!(cfg.ts_field.as_deref(), Some("updated_at"));
                assert_eq!(cfg.mode, SqlOutputMode::Rows);
            },
            other => panic!("wrong source: {}", other.kind()),
        }
    }

    #[test]
    fn test_unknown_source_type_fails_at_parse() {
        let toml = SQL_JOB.replace("type = \"sql\"", "type = \"ftp\"");
        let err = JobConfig::from_toml_str(&toml).unwrap_err();
        assert!(
            matches!(err, EtlError::UnsupportedSourceType(_)),
            "got: {err}"
        );
    }

    #[test]
    fn test_unknown_field_rejected() {
        let toml = format!("{SQL_JOB}\nretries = 3\n");
        assert!(JobConfig::from_toml_str(&toml).is_err());
    }

    #[test]
    fn test_default_key_is_period() {
        let toml = r#"
            name = "nps"

            [warehouse]
            host = "dwh.internal"
            database = "analytics"
            schema = "stage"
            user = "etl"
            password = "secret"

            [source]
            type = "rest_api"
            endpoint = "https://api.example.com/v1/answers"
        "#;
        let job = JobConfig::from_toml_str(toml).unwrap();
        assert!(job.is_periodic());
        match job.key {
            KeyConfig::Period { ref column } => assert_eq!(column, "period"),
            _ => panic!("expected period key"),
        }
    }

    #[test]
    fn test_rest_method_validated() {
        let toml = r#"
            name = "nps"

            [warehouse]
            host = "dwh.internal"
            database = "analytics"
            schema = "stage"
            user = "etl"
            password = "secret"

            [source]
            type = "rest_api"
            endpoint = "https://api.example.com"
            method = "fetch"
        "#;
        assert!(matches!(
            JobConfig::from_toml_str(toml),
            Err(EtlError::Config(_))
        ));
    }

    #[test]
    fn test_driver_default_matches_host_os() {
        let job = JobConfig::from_toml_str(SQL_JOB).unwrap();
        let SourceConfig::Sql(cfg) = &job.source else {
            panic!("expected sql source");
        };
        if cfg!(windows) {
            assert_eq!(cfg.driver_name(), "SQL Server");
        } else {
            assert_eq!(cfg.driver_name(), "ODBC Driver 18 for SQL Server");
        }
        assert!(cfg.connection_descriptor().contains("SERVER=mssql.internal,1433"));
        assert!(!cfg.connection_descriptor().contains("secret"));
    }

    #[test]
    fn test_ui_division_requires_selector() {
        let toml = r#"
            name = "crm_requests"

            [warehouse]
            host = "dwh.internal"
            database = "analytics"
            schema = "stage"
            user = "etl"
            password = "secret"

            [source]
            type = "ui"
            webdriver_url = "http://localhost:9515"
            app_url = "https://crm.example.com"
            username = "robot"
            password = "secret"
            download_dir = "/tmp/exports"

            [source.report]
            report_type = "Requests"
            menu_path = ["Sales", "Requests"]
            customize_button = "//*[@id='grid']/button"
            field_option = "//*[@id='modal']/select/option[1]"
            add_field_button = "//*[@id='modal']/a[1]"
            confirm_button = "//*[@id='modal']/button"
            interval_select = "//*[@id='interval_type']"
            start_year_select = "//*[@id='start_year']"
            start_month_select = "//*[@id='counter_min']"
            end_year_select = "//*[@id='end_year']"
            end_month_select = "//*[@id='counter_max']"
            download_button = "//*[@id='selector']/a"
            division = "BUS"
        "#;
        assert!(matches!(
            JobConfig::from_toml_str(toml),
            Err(EtlError::Config(_))
        ));
    }

    #[test]
    fn test_month_offset_under_key_table_is_rejected() {
        // Misplaced in [key] this setting would otherwise vanish and the
        // job would reload the wrong month.
        let toml = SQL_JOB.replace(
            "mode = \"ids\"",
            "mode = \"ids\"\nmonth_offset = 1",
        );
        assert!(matches!(
            JobConfig::from_toml_str(&toml),
            Err(EtlError::Config(_))
        ));
    }

    #[test]
    fn test_unknown_key_field_rejected() {
        let toml = SQL_JOB.replace(
            "column = \"request_id\"",
            "column = \"request_id\"\ntypo_field = 3",
        );
        assert!(JobConfig::from_toml_str(&toml).is_err());
    }

    #[test]
    fn test_key_fields_foreign_to_the_mode_rejected() {
        let toml = SQL_JOB.replace(
            "mode = \"ids\"\n        column = \"request_id\"",
            "mode = \"period\"\n        position = 2",
        );
        assert!(JobConfig::from_toml_str(&toml).is_err());

        let toml = SQL_JOB.replace(
            "mode = \"ids\"\n        column = \"request_id\"",
            "mode = \"full\"\n        column = \"request_id\"",
        );
        assert!(JobConfig::from_toml_str(&toml).is_err());
    }

    #[test]
    fn test_explicit_window_must_increase() {
        let toml = format!(
            "{SQL_JOB}\n[window]\nstart = \"2024-02-01T00:00:00\"\nend = \"2024-01-01T00:00:00\"\n"
        );
        assert!(matches!(
            JobConfig::from_toml_str(&toml),
            Err(EtlError::WatermarkOrder { .. })
        ));
    }
}
