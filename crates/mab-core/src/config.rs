use std::{
    collections::HashMap,
    env, fs,
    path::Path,
    time::Duration,
};

use crate::{
    access::AccessTables,
    domain::{Identity, Permission, Role, RoomId},
    errors::Error,
    retry::{RetryPolicy, RetryPresets},
    Result,
};

/// Typed configuration, validated once at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub command_prefix: String,
    pub log_level: String,

    pub security: SecurityConfig,
    pub access: AccessTables,
    pub cache: CacheConfig,
    pub retry: RetryPresets,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SecurityConfig {
    /// `false` turns the rate limiter into a pass-through.
    pub enabled: bool,
    pub max_message_length: usize,
    pub rate_limit_default: u32,
    pub rate_limit_window: Duration,
    /// Per-action request limits overriding `rate_limit_default`.
    pub rate_limits: HashMap<String, u32>,
    pub sweep_interval: Duration,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_message_length: 5000,
            rate_limit_default: 10,
            rate_limit_window: Duration::from_millis(60_000),
            rate_limits: HashMap::new(),
            sweep_interval: Duration::from_millis(60_000),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheConfig {
    pub enabled: bool,
    pub key_prefix: String,
    pub default_ttl: Duration,
    /// Route store calls through the cache retry preset.
    pub retry_enabled: bool,
    /// How often the in-memory store drops expired entries.
    pub purge_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            key_prefix: "mab:".to_string(),
            default_ttl: Duration::from_secs(3600),
            retry_enabled: false,
            purge_interval: Duration::from_secs(60),
        }
    }
}

impl Config {
    /// Load from the process environment (and `.env`, without overriding).
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset keys take their defaults;
    /// malformed values are errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).and_then(non_empty);

        // Security
        let sd = SecurityConfig::default();
        let security = SecurityConfig {
            enabled: parse_bool("SECURITY_ENABLED", get("SECURITY_ENABLED"))?.unwrap_or(sd.enabled),
            max_message_length: parse_positive::<usize>(
                "SECURITY_MAX_MESSAGE_LENGTH",
                get("SECURITY_MAX_MESSAGE_LENGTH"),
            )?
            .unwrap_or(sd.max_message_length),
            rate_limit_default: parse_positive::<u32>(
                "SECURITY_RATE_LIMIT_DEFAULT",
                get("SECURITY_RATE_LIMIT_DEFAULT"),
            )?
            .unwrap_or(sd.rate_limit_default),
            rate_limit_window: parse_positive::<u64>(
                "SECURITY_RATE_LIMIT_WINDOW",
                get("SECURITY_RATE_LIMIT_WINDOW"),
            )?
            .map(Duration::from_millis)
            .unwrap_or(sd.rate_limit_window),
            rate_limits: parse_rate_limits(get("SECURITY_RATE_LIMITS").as_deref())?,
            sweep_interval: parse_positive::<u64>(
                "SECURITY_SWEEP_INTERVAL_MS",
                get("SECURITY_SWEEP_INTERVAL_MS"),
            )?
            .map(Duration::from_millis)
            .unwrap_or(sd.sweep_interval),
        };

        // Access tables
        let mut access = AccessTables::default();
        for (identity, role) in parse_user_entries(get("ALLOWED_USERS").as_deref())? {
            access.roles.insert(identity, role);
        }
        for (key, role) in [("MODERATOR_USERS", Role::Moderator), ("ADMIN_USERS", Role::Admin)] {
            for identity in parse_identity_list(get(key).as_deref()) {
                access.roles.insert(identity, role);
            }
        }
        access.blocked = parse_identity_list(get("BLOCKED_USERS").as_deref())
            .into_iter()
            .collect();
        access.rooms = parse_room_entries(get("ALLOWED_ROOMS").as_deref())?;

        // Cache
        let cd = CacheConfig::default();
        let cache = CacheConfig {
            enabled: parse_bool("CACHE_ENABLED", get("CACHE_ENABLED"))?.unwrap_or(cd.enabled),
            key_prefix: get("CACHE_KEY_PREFIX").unwrap_or(cd.key_prefix),
            default_ttl: parse_positive::<u64>("CACHE_DEFAULT_TTL", get("CACHE_DEFAULT_TTL"))?
                .map(Duration::from_secs)
                .unwrap_or(cd.default_ttl),
            retry_enabled: parse_bool("CACHE_RETRY_ENABLED", get("CACHE_RETRY_ENABLED"))?
                .unwrap_or(cd.retry_enabled),
            purge_interval: parse_positive::<u64>(
                "CACHE_PURGE_INTERVAL_MS",
                get("CACHE_PURGE_INTERVAL_MS"),
            )?
            .map(Duration::from_millis)
            .unwrap_or(cd.purge_interval),
        };

        // Retry presets
        let retry = RetryPresets {
            http: RetryPolicy::http(),
            llm: retry_override(RetryPolicy::llm(), "LLM", &get)?,
            drive: retry_override(RetryPolicy::drive(), "DRIVE", &get)?,
            cache: retry_override(RetryPolicy::cache(), "CACHE_STORE", &get)?,
        };
        retry.validate()?;

        let command_prefix = get("COMMAND_PREFIX").unwrap_or_else(|| "!".to_string());
        let log_level = get("LOG_LEVEL")
            .map(|s| s.to_lowercase())
            .unwrap_or_else(|| "info".to_string());

        Ok(Self {
            command_prefix,
            log_level,
            security,
            access,
            cache,
            retry,
        })
    }
}

fn retry_override<F>(base: RetryPolicy, prefix: &str, get: &F) -> Result<RetryPolicy>
where
    F: Fn(&str) -> Option<String>,
{
    let attempts_key = format!("{prefix}_RETRY_ATTEMPTS");
    let delay_key = format!("{prefix}_RETRY_DELAY_MS");

    let mut policy = base;
    if let Some(n) = parse_positive::<u32>(&attempts_key, get(attempts_key.as_str()))? {
        policy = policy.with_max_attempts(n);
    }
    if let Some(ms) = parse_positive::<u64>(&delay_key, get(delay_key.as_str()))? {
        policy = policy.with_base_delay(Duration::from_millis(ms));
    }
    Ok(policy)
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() || env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn non_empty(s: String) -> Option<String> {
    let t = s.trim();
    if t.is_empty() {
        None
    } else {
        Some(t.to_string())
    }
}

fn parse_bool(key: &str, v: Option<String>) -> Result<Option<bool>> {
    let Some(v) = v else {
        return Ok(None);
    };
    match v.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        other => Err(Error::Config(format!("{key}: expected a boolean, got {other:?}"))),
    }
}

fn parse_positive<T>(key: &str, v: Option<String>) -> Result<Option<T>>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    let Some(v) = v else {
        return Ok(None);
    };
    match v.parse::<T>() {
        Ok(n) if n > T::default() => Ok(Some(n)),
        _ => Err(Error::Config(format!(
            "{key}: expected a positive integer, got {v:?}"
        ))),
    }
}

fn csv(v: Option<&str>) -> impl Iterator<Item = &str> {
    v.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// `ask:5,read:20`
fn parse_rate_limits(v: Option<&str>) -> Result<HashMap<String, u32>> {
    let mut out = HashMap::new();
    for entry in csv(v) {
        let parsed = entry
            .split_once(':')
            .and_then(|(action, n)| Some((action.trim(), n.trim().parse::<u32>().ok()?)))
            .filter(|(action, n)| !action.is_empty() && *n > 0);
        let Some((action, n)) = parsed else {
            return Err(Error::Config(format!(
                "SECURITY_RATE_LIMITS: malformed entry {entry:?}, expected action:limit"
            )));
        };
        out.insert(action.to_lowercase(), n);
    }
    Ok(out)
}

fn parse_identity_list(v: Option<&str>) -> Vec<Identity> {
    csv(v).map(Identity::new).collect()
}

/// `identity[:role]`. Identities may themselves contain `:` (`@alice:matrix.org`),
/// so the suffix after the last `:` is a role when it names one, part of the
/// identity when it looks like a server name, and an error otherwise.
fn parse_user_entries(v: Option<&str>) -> Result<Vec<(Identity, Role)>> {
    csv(v)
        .map(|entry| {
            let (identity, role) = match entry.rsplit_once(':') {
                Some((id, suffix)) => match suffix.parse::<Role>() {
                    Ok(role) => (id.trim(), role),
                    Err(_) if looks_like_server(suffix.trim()) => (entry, Role::User),
                    Err(_) => {
                        return Err(Error::Config(format!(
                            "ALLOWED_USERS: entry {entry:?} has unknown role {:?}",
                            suffix.trim()
                        )))
                    }
                },
                None => (entry, Role::User),
            };
            if identity.is_empty() {
                return Err(Error::Config(format!(
                    "ALLOWED_USERS: entry {entry:?} has no identity"
                )));
            }
            Ok((Identity::new(identity), role))
        })
        .collect()
}

/// A host (`matrix.org`, `localhost`) or a port (`8448`).
fn looks_like_server(s: &str) -> bool {
    !s.is_empty()
        && (s.contains('.')
            || s.eq_ignore_ascii_case("localhost")
            || s.bytes().all(|b| b.is_ascii_digit()))
}

/// `room[:perm|perm]`, same last-`:` rule as user entries. Default permission is `read`.
///
/// Only the fixed permission tags are recognised in the suffix, so a server
/// name like `!lobby:localhost` is never mistaken for a permission list.
fn parse_room_entries(v: Option<&str>) -> Result<HashMap<RoomId, Vec<Permission>>> {
    const KNOWN: [Permission; 5] = [
        Permission::ALL,
        Permission::READ,
        Permission::WRITE,
        Permission::SEARCH,
        Permission::HELP,
    ];

    let mut out = HashMap::new();
    for entry in csv(v) {
        let parsed = entry.rsplit_once(':').and_then(|(room, suffix)| {
            let perms = suffix
                .split('|')
                .map(|p| Permission::parse(p).filter(|p| KNOWN.contains(p)))
                .collect::<Option<Vec<_>>>()?;
            Some((room.trim(), perms))
        });
        let (room, perms) = parsed.unwrap_or((entry, vec![Permission::READ]));
        if room.is_empty() {
            return Err(Error::Config(format!(
                "ALLOWED_ROOMS: entry {entry:?} has no room id"
            )));
        }
        out.insert(RoomId::new(room), perms);
    }
    Ok(out)
}
