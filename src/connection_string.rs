//! Connection string parsing.
//!
//! A connection string is a `;` separated list of `keyword=value` pairs, for example
//! `Data Source=/var/db/app.db;Mode=ReadOnly`. Keywords are matched case-insensitively and the
//! whitespace around keywords, values and separators is ignored. A value may be wrapped in `"` or
//! `'` to carry `;` or surrounding whitespace, with a doubled quote standing for a literal one.
//!
//! When a keyword appears more than once the last occurrence wins. Unknown keywords are rejected.

use std::{fmt, str::FromStr, time::Duration};

use thiserror::Error;

/// Data source naming a private in-memory database.
pub const MEMORY: &str = ":memory:";

/// Largest `Timeout` accepted. The same value becomes the busy timeout, which the engine takes
/// as a signed 32 bit number of milliseconds.
pub const MAX_TIMEOUT_SECS: u64 = i32::MAX as u64 / 1000;

/// Error produced when a connection string can not be turned into a [`ConnectionConfiguration`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("connection string is empty")]
    Empty,

    #[error("expected keyword=value, found '{token}'")]
    MalformedPair { token: String },

    #[error("missing keyword in '{token}'")]
    EmptyKeyword { token: String },

    #[error("keyword not supported: '{keyword}'")]
    UnknownKeyword { keyword: String },

    #[error("'Data Source' is required")]
    MissingDataSource,

    #[error("'{value}' is not a valid {keyword} value, expected {expected}")]
    InvalidValue {
        keyword: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("unterminated quoted value '{token}'")]
    UnterminatedQuote { token: String },

    #[error("'{keyword}' can not be combined with '{other}'")]
    Conflict {
        keyword: &'static str,
        other: &'static str,
    },
}

/// A closed set of names accepted in a connection string, matched case-insensitively.
trait Choice: Copy + PartialEq + 'static {
    const CHOICES: &'static [(&'static str, Self)];

    fn lookup(value: &str) -> Option<Self> {
        Self::CHOICES
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(value))
            .map(|(_, choice)| *choice)
    }

    fn name(self) -> &'static str {
        Self::CHOICES
            .iter()
            .find(|(_, choice)| *choice == self)
            .map(|(name, _)| *name)
            .unwrap_or_default()
    }
}

/// How the native database is opened.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpenMode {
    /// Read and write, creating the database if it does not exist.
    #[default]
    ReadWriteCreate,
    /// Read and write an existing database.
    ReadWrite,
    /// Read an existing database.
    ReadOnly,
}

impl Choice for OpenMode {
    const CHOICES: &'static [(&'static str, Self)] = &[
        ("ReadWriteCreate", OpenMode::ReadWriteCreate),
        ("ReadWrite", OpenMode::ReadWrite),
        ("ReadOnly", OpenMode::ReadOnly),
    ];
}

/// Sharing policy for the engine's page cache.
///
/// `Shared` is the only way for two connections to the in-memory data source to see the same
/// database.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheMode {
    #[default]
    Default,
    Private,
    Shared,
}

impl Choice for CacheMode {
    const CHOICES: &'static [(&'static str, Self)] = &[
        ("Default", CacheMode::Default),
        ("Private", CacheMode::Private),
        ("Shared", CacheMode::Shared),
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SynchronousMode {
    Off,
    Normal,
    Full,
    Extra,
}

impl Choice for SynchronousMode {
    const CHOICES: &'static [(&'static str, Self)] = &[
        ("Off", SynchronousMode::Off),
        ("Normal", SynchronousMode::Normal),
        ("Full", SynchronousMode::Full),
        ("Extra", SynchronousMode::Extra),
    ];
}

impl SynchronousMode {
    /// Value understood by `PRAGMA synchronous`.
    pub fn pragma_value(self) -> i64 {
        match self {
            SynchronousMode::Off => 0,
            SynchronousMode::Normal => 1,
            SynchronousMode::Full => 2,
            SynchronousMode::Extra => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TempStore {
    Default,
    File,
    Memory,
}

impl Choice for TempStore {
    const CHOICES: &'static [(&'static str, Self)] = &[
        ("Default", TempStore::Default),
        ("File", TempStore::File),
        ("Memory", TempStore::Memory),
    ];
}

impl TempStore {
    /// Value understood by `PRAGMA temp_store`.
    pub fn pragma_value(self) -> i64 {
        match self {
            TempStore::Default => 0,
            TempStore::File => 1,
            TempStore::Memory => 2,
        }
    }
}

/// Text encoding used when the engine creates a new database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextEncoding {
    Utf8,
    Utf16,
    Utf16Le,
    Utf16Be,
}

impl Choice for TextEncoding {
    const CHOICES: &'static [(&'static str, Self)] = &[
        ("UTF-8", TextEncoding::Utf8),
        ("UTF8", TextEncoding::Utf8),
        ("UTF-16", TextEncoding::Utf16),
        ("UTF16", TextEncoding::Utf16),
        ("UTF-16le", TextEncoding::Utf16Le),
        ("UTF16le", TextEncoding::Utf16Le),
        ("UTF-16be", TextEncoding::Utf16Be),
        ("UTF16be", TextEncoding::Utf16Be),
    ];
}

impl TextEncoding {
    /// Value understood by `PRAGMA encoding`.
    pub fn pragma_value(self) -> &'static str {
        self.name()
    }
}

macro_rules! display_choice {
    ($($ty:ty),*) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.name())
                }
            }
        )*
    };
}

display_choice!(OpenMode, CacheMode, SynchronousMode, TempStore, TextEncoding);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Keyword {
    DataSource,
    Mode,
    Cache,
    Timeout,
    CacheSize,
    PageSize,
    Synchronous,
    TempStore,
    TempStoreDirectory,
    Encoding,
    AutoVacuum,
    CaseSensitiveLike,
    ForeignKeys,
}

impl Choice for Keyword {
    // The first entry for each keyword is its canonical spelling.
    const CHOICES: &'static [(&'static str, Self)] = &[
        ("Data Source", Keyword::DataSource),
        ("DataSource", Keyword::DataSource),
        ("Filename", Keyword::DataSource),
        ("Mode", Keyword::Mode),
        ("Cache", Keyword::Cache),
        ("Timeout", Keyword::Timeout),
        ("Default Timeout", Keyword::Timeout),
        ("Cache Size", Keyword::CacheSize),
        ("Page Size", Keyword::PageSize),
        ("Synchronous", Keyword::Synchronous),
        ("Temp Store", Keyword::TempStore),
        ("Temporary Storage Folder", Keyword::TempStoreDirectory),
        ("Temp Store Directory", Keyword::TempStoreDirectory),
        ("Encoding", Keyword::Encoding),
        ("Auto Vacuum", Keyword::AutoVacuum),
        ("Case Sensitive Like", Keyword::CaseSensitiveLike),
        ("Foreign Keys", Keyword::ForeignKeys),
    ];
}

impl Keyword {
    fn expected(self) -> &'static str {
        match self {
            Keyword::DataSource => "a file path or :memory:",
            Keyword::Mode => "ReadWriteCreate, ReadWrite or ReadOnly",
            Keyword::Cache => "Default, Private or Shared",
            Keyword::Timeout => "a number of seconds up to 2147483",
            Keyword::CacheSize => "an integer",
            Keyword::PageSize => "a power of two between 512 and 65536",
            Keyword::Synchronous => "Off, Normal, Full or Extra",
            Keyword::TempStore => "Default, File or Memory",
            Keyword::TempStoreDirectory => "a directory path",
            Keyword::Encoding => "UTF-8, UTF-16, UTF-16le or UTF-16be",
            Keyword::AutoVacuum | Keyword::CaseSensitiveLike | Keyword::ForeignKeys => {
                "true or false"
            }
        }
    }

    fn invalid(self, value: &str) -> ParseError {
        ParseError::InvalidValue {
            keyword: self.name(),
            value: value.to_string(),
            expected: self.expected(),
        }
    }
}

/// Validated, immutable settings for opening a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfiguration {
    data_source: String,
    mode: OpenMode,
    cache: CacheMode,
    timeout: Option<Duration>,
    cache_size: Option<i64>,
    page_size: Option<u32>,
    synchronous: Option<SynchronousMode>,
    temp_store: Option<TempStore>,
    temp_store_directory: Option<String>,
    encoding: Option<TextEncoding>,
    auto_vacuum: Option<bool>,
    case_sensitive_like: Option<bool>,
    foreign_keys: Option<bool>,
}

impl ConnectionConfiguration {
    /// Creates a configuration for the given data source with every other setting left at its
    /// default.
    pub fn new(data_source: impl Into<String>) -> Result<Self, ParseError> {
        let data_source = data_source.into();
        if data_source.trim().is_empty() {
            return Err(ParseError::MissingDataSource);
        }

        if data_source.eq_ignore_ascii_case(MEMORY) {
            return Ok(Self::memory());
        }

        Ok(Self::with_data_source(data_source))
    }

    /// Configuration for a private in-memory database.
    pub fn memory() -> Self {
        Self::with_data_source(MEMORY.to_string())
    }

    fn with_data_source(data_source: String) -> Self {
        Self {
            data_source,
            mode: OpenMode::default(),
            cache: CacheMode::default(),
            timeout: None,
            cache_size: None,
            page_size: None,
            synchronous: None,
            temp_store: None,
            temp_store_directory: None,
            encoding: None,
            auto_vacuum: None,
            case_sensitive_like: None,
            foreign_keys: None,
        }
    }

    pub fn mode(mut self, mode: OpenMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn cache(mut self, cache: CacheMode) -> Self {
        self.cache = cache;
        self
    }

    /// Sets the open deadline in whole seconds, at most [`MAX_TIMEOUT_SECS`]. Zero disables the
    /// deadline.
    pub fn timeout_secs(mut self, secs: u64) -> Result<Self, ParseError> {
        if secs > MAX_TIMEOUT_SECS {
            return Err(Keyword::Timeout.invalid(&secs.to_string()));
        }

        self.timeout = (secs > 0).then(|| Duration::from_secs(secs));
        Ok(self)
    }

    pub fn cache_size(mut self, pages: i64) -> Self {
        self.cache_size = Some(pages);
        self
    }

    pub fn page_size(mut self, bytes: u32) -> Result<Self, ParseError> {
        if !valid_page_size(bytes) {
            return Err(Keyword::PageSize.invalid(&bytes.to_string()));
        }

        self.page_size = Some(bytes);
        Ok(self)
    }

    pub fn synchronous(mut self, mode: SynchronousMode) -> Self {
        self.synchronous = Some(mode);
        self
    }

    pub fn temp_store(mut self, store: TempStore) -> Self {
        self.temp_store = Some(store);
        self
    }

    /// Directory the engine places its temporary files in.
    pub fn temp_store_directory(mut self, path: impl Into<String>) -> Result<Self, ParseError> {
        let path = path.into();
        if path.trim().is_empty() {
            return Err(Keyword::TempStoreDirectory.invalid(&path));
        }

        self.temp_store_directory = Some(path);
        Ok(self)
    }

    pub fn encoding(mut self, encoding: TextEncoding) -> Self {
        self.encoding = Some(encoding);
        self
    }

    pub fn auto_vacuum(mut self, enabled: bool) -> Self {
        self.auto_vacuum = Some(enabled);
        self
    }

    pub fn case_sensitive_like(mut self, enabled: bool) -> Self {
        self.case_sensitive_like = Some(enabled);
        self
    }

    pub fn foreign_keys(mut self, enabled: bool) -> Self {
        self.foreign_keys = Some(enabled);
        self
    }

    pub fn data_source(&self) -> &str {
        &self.data_source
    }

    /// Whether the data source is the in-memory database.
    pub fn is_memory(&self) -> bool {
        self.data_source == MEMORY
    }

    pub fn open_mode(&self) -> OpenMode {
        self.mode
    }

    pub fn cache_mode(&self) -> CacheMode {
        self.cache
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn cache_size_pages(&self) -> Option<i64> {
        self.cache_size
    }

    pub fn page_size_bytes(&self) -> Option<u32> {
        self.page_size
    }

    pub fn synchronous_mode(&self) -> Option<SynchronousMode> {
        self.synchronous
    }

    pub fn temp_store_mode(&self) -> Option<TempStore> {
        self.temp_store
    }

    pub fn temp_store_directory_path(&self) -> Option<&str> {
        self.temp_store_directory.as_deref()
    }

    pub fn text_encoding(&self) -> Option<TextEncoding> {
        self.encoding
    }

    pub fn auto_vacuum_enabled(&self) -> Option<bool> {
        self.auto_vacuum
    }

    pub fn case_sensitive_like_enabled(&self) -> Option<bool> {
        self.case_sensitive_like
    }

    pub fn foreign_keys_enabled(&self) -> Option<bool> {
        self.foreign_keys
    }

    fn validate(&self) -> Result<(), ParseError> {
        if self.mode == OpenMode::ReadOnly {
            // These settings only take effect when the engine writes the database header.
            if self.page_size.is_some() {
                return Err(ParseError::Conflict {
                    keyword: Keyword::PageSize.name(),
                    other: "Mode=ReadOnly",
                });
            }

            if self.auto_vacuum.is_some() {
                return Err(ParseError::Conflict {
                    keyword: Keyword::AutoVacuum.name(),
                    other: "Mode=ReadOnly",
                });
            }

            if self.encoding.is_some() {
                return Err(ParseError::Conflict {
                    keyword: Keyword::Encoding.name(),
                    other: "Mode=ReadOnly",
                });
            }
        }

        Ok(())
    }
}

impl FromStr for ConnectionConfiguration {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse(s)
    }
}

/// Writes the canonical connection string, omitting settings left at their defaults.
impl fmt::Display for ConnectionConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_pair(f, Keyword::DataSource, &self.data_source)?;
        if self.mode != OpenMode::default() {
            write_pair(f, Keyword::Mode, self.mode)?;
        }

        if self.cache != CacheMode::default() {
            write_pair(f, Keyword::Cache, self.cache)?;
        }

        if let Some(timeout) = self.timeout {
            write_pair(f, Keyword::Timeout, timeout.as_secs())?;
        }

        if let Some(cache_size) = self.cache_size {
            write_pair(f, Keyword::CacheSize, cache_size)?;
        }

        if let Some(page_size) = self.page_size {
            write_pair(f, Keyword::PageSize, page_size)?;
        }

        if let Some(synchronous) = self.synchronous {
            write_pair(f, Keyword::Synchronous, synchronous)?;
        }

        if let Some(temp_store) = self.temp_store {
            write_pair(f, Keyword::TempStore, temp_store)?;
        }

        if let Some(directory) = &self.temp_store_directory {
            write_pair(f, Keyword::TempStoreDirectory, directory)?;
        }

        if let Some(encoding) = self.encoding {
            write_pair(f, Keyword::Encoding, encoding)?;
        }

        if let Some(auto_vacuum) = self.auto_vacuum {
            write_pair(f, Keyword::AutoVacuum, auto_vacuum)?;
        }

        if let Some(case_sensitive_like) = self.case_sensitive_like {
            write_pair(f, Keyword::CaseSensitiveLike, case_sensitive_like)?;
        }

        if let Some(foreign_keys) = self.foreign_keys {
            write_pair(f, Keyword::ForeignKeys, foreign_keys)?;
        }

        Ok(())
    }
}

fn write_pair(f: &mut fmt::Formatter<'_>, keyword: Keyword, value: impl fmt::Display) -> fmt::Result {
    if keyword != Keyword::DataSource {
        write!(f, ";")?;
    }

    let value = value.to_string();
    if needs_quotes(&value) {
        write!(f, "{}=\"{}\"", keyword.name(), value.replace('"', "\"\""))
    } else {
        write!(f, "{}={}", keyword.name(), value)
    }
}

fn needs_quotes(value: &str) -> bool {
    value.contains(';')
        || value.starts_with(['"', '\''])
        || value.starts_with(char::is_whitespace)
        || value.ends_with(char::is_whitespace)
}

fn valid_page_size(bytes: u32) -> bool {
    (512..=65536).contains(&bytes) && bytes.is_power_of_two()
}

type ParseResult<'a, T> = std::result::Result<(&'a str, T), ParseError>;

fn skip_whitespace(input: &str) -> &str {
    input.trim_start()
}

/// Returns the text of the pair starting at `input`, for diagnostics.
fn segment(input: &str) -> String {
    input.split(';').next().unwrap_or_default().trim().to_string()
}

/// Parses a keyword up to and including the `=` that terminates it.
#[tracing::instrument(level = "trace", err)]
fn parse_keyword(input: &str) -> ParseResult<'_, String> {
    let input = skip_whitespace(input);
    match input.find(['=', ';']) {
        Some(i) if input[i..].starts_with('=') => {
            let keyword = input[..i].trim();
            if keyword.is_empty() {
                return Err(ParseError::EmptyKeyword {
                    token: segment(input),
                });
            }

            Ok((&input[i + 1..], keyword.to_string()))
        }

        _ => Err(ParseError::MalformedPair {
            token: segment(input),
        }),
    }
}

/// Parses a value wrapped in `quote`, where a doubled quote is a literal quote character.
#[tracing::instrument(level = "trace", err)]
fn parse_quoted(input: &str, quote: char) -> ParseResult<'_, String> {
    let mut value = String::new();
    let mut chars = input.char_indices().skip(1).peekable();
    while let Some((i, c)) = chars.next() {
        if c != quote {
            value.push(c);
            continue;
        }

        if chars.peek().map(|(_, next)| *next) == Some(quote) {
            value.push(quote);
            chars.next();
            continue;
        }

        let rest = skip_whitespace(&input[i + c.len_utf8()..]);
        if !rest.is_empty() && !rest.starts_with(';') {
            return Err(ParseError::MalformedPair {
                token: segment(input),
            });
        }

        return Ok((rest, value));
    }

    Err(ParseError::UnterminatedQuote {
        token: input.to_string(),
    })
}

/// Parses a value up to the next `;` or the end of input.
#[tracing::instrument(level = "trace", err)]
fn parse_value(input: &str) -> ParseResult<'_, String> {
    let input = skip_whitespace(input);
    match input.chars().next() {
        Some(quote @ ('"' | '\'')) => parse_quoted(input, quote),
        _ => {
            let end = input.find(';').unwrap_or(input.len());
            Ok((&input[end..], input[..end].trim_end().to_string()))
        }
    }
}

/// Parses one `keyword=value` pair along with the separator that follows it.
#[tracing::instrument(level = "trace", err)]
fn parse_pair(input: &str) -> ParseResult<'_, (String, String)> {
    let (input, keyword) = parse_keyword(input)?;
    let (input, value) = parse_value(input)?;
    let input = input.strip_prefix(';').unwrap_or(input);
    Ok((input, (keyword, value)))
}

fn parse_bool(keyword: Keyword, value: &str) -> Result<bool, ParseError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(keyword.invalid(value)),
    }
}

fn parse_choice<T: Choice>(keyword: Keyword, value: &str) -> Result<T, ParseError> {
    T::lookup(value).ok_or_else(|| keyword.invalid(value))
}

fn parse_number<T: FromStr>(keyword: Keyword, value: &str) -> Result<T, ParseError> {
    value.parse().map_err(|_| keyword.invalid(value))
}

/// Settings collected while parsing, before the data source has been validated.
#[derive(Default)]
struct Settings {
    data_source: Option<String>,
    mode: Option<OpenMode>,
    cache: Option<CacheMode>,
    timeout_secs: Option<u64>,
    cache_size: Option<i64>,
    page_size: Option<u32>,
    synchronous: Option<SynchronousMode>,
    temp_store: Option<TempStore>,
    temp_store_directory: Option<String>,
    encoding: Option<TextEncoding>,
    auto_vacuum: Option<bool>,
    case_sensitive_like: Option<bool>,
    foreign_keys: Option<bool>,
}

impl Settings {
    fn apply(&mut self, keyword: Keyword, value: String) -> Result<(), ParseError> {
        match keyword {
            Keyword::DataSource => self.data_source = Some(value),
            Keyword::Mode => self.mode = Some(parse_choice(keyword, &value)?),
            Keyword::Cache => self.cache = Some(parse_choice(keyword, &value)?),
            Keyword::Timeout => {
                let secs = parse_number(keyword, &value)?;
                if secs > MAX_TIMEOUT_SECS {
                    return Err(keyword.invalid(&value));
                }

                self.timeout_secs = Some(secs);
            }
            Keyword::CacheSize => self.cache_size = Some(parse_number(keyword, &value)?),
            Keyword::PageSize => {
                let bytes = parse_number(keyword, &value)?;
                if !valid_page_size(bytes) {
                    return Err(keyword.invalid(&value));
                }

                self.page_size = Some(bytes);
            }
            Keyword::Synchronous => self.synchronous = Some(parse_choice(keyword, &value)?),
            Keyword::TempStore => self.temp_store = Some(parse_choice(keyword, &value)?),
            Keyword::TempStoreDirectory => {
                if value.trim().is_empty() {
                    return Err(keyword.invalid(&value));
                }

                self.temp_store_directory = Some(value);
            }
            Keyword::Encoding => self.encoding = Some(parse_choice(keyword, &value)?),
            Keyword::AutoVacuum => self.auto_vacuum = Some(parse_bool(keyword, &value)?),
            Keyword::CaseSensitiveLike => {
                self.case_sensitive_like = Some(parse_bool(keyword, &value)?)
            }
            Keyword::ForeignKeys => self.foreign_keys = Some(parse_bool(keyword, &value)?),
        }

        Ok(())
    }

    fn finish(self) -> Result<ConnectionConfiguration, ParseError> {
        let data_source = self.data_source.ok_or(ParseError::MissingDataSource)?;
        let mut config = ConnectionConfiguration::new(data_source)?
            .mode(self.mode.unwrap_or_default())
            .cache(self.cache.unwrap_or_default())
            .timeout_secs(self.timeout_secs.unwrap_or_default())?;

        config.cache_size = self.cache_size;
        config.page_size = self.page_size;
        config.synchronous = self.synchronous;
        config.temp_store = self.temp_store;
        config.temp_store_directory = self.temp_store_directory;
        config.encoding = self.encoding;
        config.auto_vacuum = self.auto_vacuum;
        config.case_sensitive_like = self.case_sensitive_like;
        config.foreign_keys = self.foreign_keys;
        config.validate()?;
        Ok(config)
    }
}

/// Parses a connection string into a validated configuration.
#[tracing::instrument(level = "trace", err)]
pub fn parse(raw: &str) -> Result<ConnectionConfiguration, ParseError> {
    if raw.trim().is_empty() {
        return Err(ParseError::Empty);
    }

    let mut settings = Settings::default();
    let mut input = skip_whitespace(raw);
    while !input.is_empty() {
        if let Some(rest) = input.strip_prefix(';') {
            input = skip_whitespace(rest);
            continue;
        }

        let (rest, (keyword, value)) = parse_pair(input)?;
        let Some(known) = Keyword::lookup(&keyword) else {
            return Err(ParseError::UnknownKeyword { keyword });
        };

        tracing::trace!("{}={}", known.name(), value);
        settings.apply(known, value)?;
        input = skip_whitespace(rest);
    }

    settings.finish()
}
