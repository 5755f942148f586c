//! # Configuration parsing and rule resolution.
//!
//! The configuration is a nested key/value text. Levels are positional:
//! the root (level 0) holds global defaults and top-level rules, groups
//! (level 1) hold per-group defaults and rules, and rule bodies (level 2)
//! are leaves. A node is a *rule* when it carries a `test` key; otherwise
//! it is the defaults entry for its level.
//!
//! Parsing happens in two stages:
//!
//! 1. a small recursive-descent parser builds an ordered `(key, value)`
//!    tree ([`Value`]), with no knowledge of rule semantics;
//! 2. the walk classifies nodes, validates field types and ranges, tracks
//!    which fields were explicitly assigned, and finally resolves
//!    inheritance (rule <- group defaults <- root defaults) and the
//!    post-conditions on the resolved set.
//!
//! Inheritance applies to a field only when it was not explicitly set and
//! still holds its zero value, so an explicit zero survives resolution.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::rule::{Rule, RuleStatus};

/// Name of the root defaults entry and the group assigned to top-level rules.
const ROOT_NAME: &str = "default";

/// The resolved rule set.
///
/// `rules` is keyed by fully qualified rule name; `order` lists those names
/// in depth-first parse order, which is the order the dispatcher honors.
#[derive(Debug, Default, Clone)]
pub struct Config {
    pub rules: HashMap<String, Rule>,
    pub order: Vec<String>,
}

impl Config {
    /// Loads and resolves a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        text.parse()
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(text: &str) -> Result<Self, ConfigError> {
        let tree = Parser::new(text).parse_document()?;
        let mut walker = Walker::default();
        walker.walk(&tree, "", "", Level::Root)?;
        Ok(walker.resolve())
    }
}

// ---- parse tree ----

/// One parsed configuration value. Objects keep their entries in source
/// order; that order is what makes rule scheduling deterministic.
#[derive(Debug, Clone, PartialEq)]
enum Value {
    Str(String),
    Int(i64),
    Float(f64),
    /// A number with a time unit, normalized to seconds.
    Time(f64),
    Array(Vec<Value>),
    Object(Vec<(String, Value)>),
}

// ---- lexer / parser ----

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Str(String),
    Int(i64),
    Float(f64),
    Time(f64),
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Assign,
    Sep,
    Eof,
}

struct Parser<'a> {
    src: &'a [u8],
    pos: usize,
    line: usize,
    peeked: Option<Token>,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            src: text.as_bytes(),
            pos: 0,
            line: 1,
            peeked: None,
        }
    }

    fn syntax(&self, message: impl Into<String>) -> ConfigError {
        ConfigError::Syntax {
            line: self.line,
            message: message.into(),
        }
    }

    fn parse_document(mut self) -> Result<Vec<(String, Value)>, ConfigError> {
        self.parse_body(false)
    }

    // ---- tokens ----

    fn peek(&mut self) -> Result<&Token, ConfigError> {
        if self.peeked.is_none() {
            self.peeked = Some(self.lex()?);
        }
        Ok(self.peeked.as_ref().expect("just filled"))
    }

    fn next(&mut self) -> Result<Token, ConfigError> {
        match self.peeked.take() {
            Some(t) => Ok(t),
            None => self.lex(),
        }
    }

    fn lex(&mut self) -> Result<Token, ConfigError> {
        loop {
            match self.src.get(self.pos) {
                None => return Ok(Token::Eof),
                Some(b' ') | Some(b'\t') | Some(b'\r') => self.pos += 1,
                Some(b'#') => {
                    while !matches!(self.src.get(self.pos), None | Some(b'\n')) {
                        self.pos += 1;
                    }
                }
                Some(b'\n') => {
                    self.pos += 1;
                    self.line += 1;
                    return Ok(Token::Sep);
                }
                Some(b';') | Some(b',') => {
                    self.pos += 1;
                    return Ok(Token::Sep);
                }
                Some(b'=') | Some(b':') => {
                    self.pos += 1;
                    return Ok(Token::Assign);
                }
                Some(b'{') => {
                    self.pos += 1;
                    return Ok(Token::LBrace);
                }
                Some(b'}') => {
                    self.pos += 1;
                    return Ok(Token::RBrace);
                }
                Some(b'[') => {
                    self.pos += 1;
                    return Ok(Token::LBracket);
                }
                Some(b']') => {
                    self.pos += 1;
                    return Ok(Token::RBracket);
                }
                Some(b'"') => return self.lex_string(),
                Some(_) => return Ok(self.lex_atom()),
            }
        }
    }

    fn lex_string(&mut self) -> Result<Token, ConfigError> {
        self.pos += 1; // opening quote
        let mut out = String::new();
        loop {
            match self.src.get(self.pos) {
                None | Some(b'\n') => return Err(self.syntax("unterminated string")),
                Some(b'"') => {
                    self.pos += 1;
                    return Ok(Token::Str(out));
                }
                Some(b'\\') => {
                    self.pos += 1;
                    let escaped = match self.src.get(self.pos) {
                        Some(b'n') => '\n',
                        Some(b't') => '\t',
                        Some(b'"') => '"',
                        Some(b'\\') => '\\',
                        _ => return Err(self.syntax("invalid escape sequence")),
                    };
                    out.push(escaped);
                    self.pos += 1;
                }
                Some(&b) => {
                    out.push(b as char);
                    self.pos += 1;
                }
            }
        }
    }

    /// Lexes a run of non-delimiter bytes and interprets it as an integer,
    /// a float, a duration (number + unit suffix), or a bare word.
    fn lex_atom(&mut self) -> Token {
        const DELIMS: &[u8] = b" \t\r\n;,=:{}[]#\"";
        let start = self.pos;
        while let Some(b) = self.src.get(self.pos) {
            if DELIMS.contains(b) {
                break;
            }
            self.pos += 1;
        }
        let atom = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();

        if let Ok(i) = atom.parse::<i64>() {
            return Token::Int(i);
        }
        if let Ok(f) = atom.parse::<f64>() {
            return Token::Float(f);
        }
        for (suffix, scale) in [
            ("ms", 1e-3),
            ("min", 60.0),
            ("s", 1.0),
            ("h", 3600.0),
            ("d", 86400.0),
        ] {
            if let Some(number) = atom.strip_suffix(suffix) {
                if let Ok(f) = number.parse::<f64>() {
                    return Token::Time(f * scale);
                }
            }
        }
        Token::Word(atom)
    }

    // ---- grammar ----

    /// `key = value`, `key { ... }`, separated by `;`, `,`, or newlines.
    fn parse_body(&mut self, braced: bool) -> Result<Vec<(String, Value)>, ConfigError> {
        let mut entries = Vec::new();
        loop {
            while *self.peek()? == Token::Sep {
                self.next()?;
            }
            match self.peek()? {
                Token::Eof => {
                    if braced {
                        return Err(self.syntax("unexpected end of input, expected '}'"));
                    }
                    return Ok(entries);
                }
                Token::RBrace if braced => {
                    self.next()?;
                    return Ok(entries);
                }
                _ => {}
            }

            let key = match self.next()? {
                Token::Word(w) => w,
                Token::Str(s) => s,
                other => return Err(self.syntax(format!("expected a key, got {other:?}"))),
            };

            let value = match self.peek()?.clone() {
                Token::Assign => {
                    self.next()?;
                    // `key = { ... }` and `key : { ... }` are accepted too
                    self.parse_value()?
                }
                Token::LBrace => {
                    self.next()?;
                    Value::Object(self.parse_body(true)?)
                }
                other => {
                    return Err(self.syntax(format!(
                        "expected '=' or '{{' after '{key}', got {other:?}"
                    )))
                }
            };

            entries.push((key, value));
        }
    }

    fn parse_value(&mut self) -> Result<Value, ConfigError> {
        match self.next()? {
            Token::Str(s) | Token::Word(s) => Ok(Value::Str(s)),
            Token::Int(i) => Ok(Value::Int(i)),
            Token::Float(f) => Ok(Value::Float(f)),
            Token::Time(t) => Ok(Value::Time(t)),
            Token::LBrace => Ok(Value::Object(self.parse_body(true)?)),
            Token::LBracket => self.parse_array(),
            other => Err(self.syntax(format!("expected a value, got {other:?}"))),
        }
    }

    fn parse_array(&mut self) -> Result<Value, ConfigError> {
        let mut items = Vec::new();
        loop {
            while *self.peek()? == Token::Sep {
                self.next()?;
            }
            if *self.peek()? == Token::RBracket {
                self.next()?;
                return Ok(Value::Array(items));
            }
            items.push(self.parse_value()?);
        }
    }
}

// ---- resolver walk ----

/// How far we are nested into the config.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Level {
    Root,
    Group,
    Rule,
}

/// Which fields a node explicitly assigned. An explicitly assigned field is
/// never replaced by inheritance, even when it holds its zero value.
#[derive(Clone, Copy, Debug, Default)]
struct Found {
    interval: bool,
    interval_fail: bool,
    start_delay: bool,
    timeout_int: bool,
    timeout_kill: bool,
    runs: bool,
    change_fail_debounce: bool,
    change_success_debounce: bool,
}

#[derive(Default)]
struct Walker {
    rules: HashMap<String, Rule>,
    order: Vec<String>,
    defaults: HashMap<String, Rule>,
    found: HashMap<String, Found>,
}

impl Walker {
    fn walk(
        &mut self,
        entries: &[(String, Value)],
        key: &str,
        parent: &str,
        level: Level,
    ) -> Result<(), ConfigError> {
        let name = self.build_name(key, parent, level)?;

        let is_rule = entries
            .iter()
            .any(|(k, _)| k.eq_ignore_ascii_case("test"));

        let next_level = match level {
            Level::Root => Level::Group,
            Level::Group => Level::Rule,
            Level::Rule => {
                if !is_rule {
                    return Err(ConfigError::MissingTest { name });
                }
                Level::Rule
            }
        };

        let mut rule = Rule::new(name.clone(), parent);
        if name == ROOT_NAME {
            // initial values on the root entry; everything else starts zeroed
            rule.interval = Duration::from_secs(1);
            rule.timeout_int = Duration::from_secs(1);
        }
        let mut found = Found::default();

        // reserve the name before walking children so their uniqueness
        // checks see this node
        if is_rule {
            self.rules.insert(name.clone(), rule.clone());
            self.order.push(name.clone());
        } else {
            self.defaults.insert(name.clone(), rule.clone());
        }

        for (field, value) in entries {
            if let Value::Object(child) = value {
                if level == Level::Rule {
                    return Err(ConfigError::NestedRule {
                        name,
                        field: field.clone(),
                    });
                }
                self.walk(child, field, &name, next_level)?;
                continue;
            }
            self.apply_field(&mut rule, &mut found, &name, field, value)?;
        }

        if is_rule {
            self.rules.insert(name.clone(), rule);
            self.found.insert(name, found);
        } else {
            self.defaults.insert(name, rule);
        }

        Ok(())
    }

    fn build_name(&self, key: &str, parent: &str, level: Level) -> Result<String, ConfigError> {
        if level == Level::Root {
            return Ok(ROOT_NAME.to_string());
        }

        if key.is_empty() {
            return Err(ConfigError::MissingName);
        }
        let name = if parent == ROOT_NAME {
            key.to_string()
        } else {
            format!("{parent}/{key}")
        };

        if self.rules.contains_key(&name) || self.defaults.contains_key(&name) {
            return Err(ConfigError::DuplicateName { name });
        }
        Ok(name)
    }

    fn apply_field(
        &self,
        rule: &mut Rule,
        found: &mut Found,
        name: &str,
        field: &str,
        value: &Value,
    ) -> Result<(), ConfigError> {
        match field.to_ascii_lowercase().as_str() {
            "status" => {
                let s = expect_string(name, field, value)?;
                rule.status = match s.to_ascii_lowercase().as_str() {
                    "enabled" => RuleStatus::Enabled,
                    "disabled" => RuleStatus::Disabled,
                    "always-fail" => RuleStatus::AlwaysFail,
                    "always-success" => RuleStatus::AlwaysSuccess,
                    _ => {
                        return Err(ConfigError::BadValue {
                            name: name.to_string(),
                            field: field.to_string(),
                            message: format!("'{s}' is not a recognized status"),
                        })
                    }
                };
            }
            "start_delay" => {
                rule.start_delay = expect_duration(name, field, value)?;
                found.start_delay = true;
            }
            "interval" => {
                rule.interval = expect_duration(name, field, value)?;
                found.interval = true;
            }
            "interval_fail" => {
                rule.interval_fail = expect_duration(name, field, value)?;
                found.interval_fail = true;
            }
            "timeout_int" => {
                rule.timeout_int = expect_duration(name, field, value)?;
                found.timeout_int = true;
            }
            "timeout_kill" => {
                rule.timeout_kill = expect_duration(name, field, value)?;
                found.timeout_kill = true;
            }
            "test" => rule.test = expect_string(name, field, value)?,
            "change_fail" => rule.change_fail = expect_string(name, field, value)?,
            "change_success" => rule.change_success = expect_string(name, field, value)?,
            "test_arguments" => rule.test_arguments = expect_strings(name, field, value)?,
            "change_fail_arguments" => {
                rule.change_fail_arguments = expect_strings(name, field, value)?
            }
            "change_success_arguments" => {
                rule.change_success_arguments = expect_strings(name, field, value)?
            }
            "runs" => {
                rule.runs = expect_int(name, field, value, 0)?;
                found.runs = true;
            }
            "change_fail_debounce" => {
                rule.change_fail_debounce = expect_int(name, field, value, 1)?;
                found.change_fail_debounce = true;
            }
            "change_success_debounce" => {
                rule.change_success_debounce = expect_int(name, field, value, 1)?;
                found.change_success_debounce = true;
            }
            _ => {
                return Err(ConfigError::UnknownField {
                    name: name.to_string(),
                    field: field.to_string(),
                })
            }
        }
        Ok(())
    }

    /// Applies group and root inheritance plus the resolved-set
    /// post-conditions, then discards the defaults bookkeeping.
    fn resolve(mut self) -> Config {
        for name in &self.order {
            let Some(mut rule) = self.rules.remove(name) else {
                continue;
            };
            let found = self.found.get(name).copied().unwrap_or_default();

            // inherit group first, then root
            if let Some(group) = self.defaults.get(&rule.group_name) {
                inherit(&mut rule, group, &found);
                if let Some(root) = self.defaults.get(&group.group_name) {
                    inherit(&mut rule, root, &found);
                }
            }

            if rule.status == RuleStatus::Unset {
                rule.status = RuleStatus::Enabled;
            }
            if !found.interval_fail && rule.interval_fail.is_zero() {
                rule.interval_fail = rule.interval;
            }
            if !found.change_fail_debounce && rule.change_fail_debounce == 0 {
                rule.change_fail_debounce = 1;
            }
            if !found.change_success_debounce && rule.change_success_debounce == 0 {
                rule.change_success_debounce = 1;
            }

            self.rules.insert(name.clone(), rule);
        }

        Config {
            rules: self.rules,
            order: self.order,
        }
    }
}

/// Copies inheritable fields from `src` onto `dst` where `dst` did not set
/// them explicitly and still holds the zero value. The zero check matters:
/// a value may have come from the group, and we are now in the root pass.
fn inherit(dst: &mut Rule, src: &Rule, found: &Found) {
    if dst.status == RuleStatus::Unset {
        dst.status = src.status;
    }
    if !found.runs && dst.runs == 0 {
        dst.runs = src.runs;
    }
    if !found.interval && dst.interval.is_zero() {
        dst.interval = src.interval;
    }
    if !found.interval_fail && dst.interval_fail.is_zero() {
        dst.interval_fail = src.interval_fail;
    }
    if !found.start_delay && dst.start_delay.is_zero() {
        dst.start_delay = src.start_delay;
    }
    if !found.timeout_int && dst.timeout_int.is_zero() {
        dst.timeout_int = src.timeout_int;
    }
    if !found.timeout_kill && dst.timeout_kill.is_zero() {
        dst.timeout_kill = src.timeout_kill;
    }
    if !found.change_fail_debounce && dst.change_fail_debounce == 0 {
        dst.change_fail_debounce = src.change_fail_debounce;
    }
    if !found.change_success_debounce && dst.change_success_debounce == 0 {
        dst.change_success_debounce = src.change_success_debounce;
    }
}

// ---- field typing helpers ----

fn expect_string(name: &str, field: &str, value: &Value) -> Result<String, ConfigError> {
    match value {
        Value::Str(s) => Ok(s.clone()),
        _ => Err(ConfigError::WrongType {
            name: name.to_string(),
            field: field.to_string(),
            expected: "a string type",
        }),
    }
}

fn expect_strings(name: &str, field: &str, value: &Value) -> Result<Vec<String>, ConfigError> {
    match value {
        Value::Str(s) => Ok(vec![s.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::Str(s) => Ok(s.clone()),
                _ => Err(ConfigError::WrongType {
                    name: name.to_string(),
                    field: field.to_string(),
                    expected: "only string elements",
                }),
            })
            .collect(),
        _ => Err(ConfigError::WrongType {
            name: name.to_string(),
            field: field.to_string(),
            expected: "a string or an array of strings",
        }),
    }
}

fn expect_duration(name: &str, field: &str, value: &Value) -> Result<Duration, ConfigError> {
    let seconds = match value {
        Value::Int(i) => *i as f64,
        Value::Float(f) => *f,
        Value::Time(t) => *t,
        _ => {
            return Err(ConfigError::WrongType {
                name: name.to_string(),
                field: field.to_string(),
                expected: "a valid numeric type",
            })
        }
    };
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(ConfigError::OutOfRange {
            name: name.to_string(),
            field: field.to_string(),
            range: "0..",
        });
    }
    Ok(Duration::from_secs_f64(seconds))
}

fn expect_int(name: &str, field: &str, value: &Value, min: u16) -> Result<u16, ConfigError> {
    let range = if min == 0 { "0..65535" } else { "1..65535" };
    match value {
        Value::Int(i) if *i >= i64::from(min) && *i <= 65535 => Ok(*i as u16),
        Value::Int(_) => Err(ConfigError::OutOfRange {
            name: name.to_string(),
            field: field.to_string(),
            range,
        }),
        _ => Err(ConfigError::WrongType {
            name: name.to_string(),
            field: field.to_string(),
            expected: "an integer type",
        }),
    }
}
