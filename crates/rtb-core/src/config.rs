use std::{env, fs, path::Path, path::PathBuf, time::Duration};

use chrono_tz::Tz;

use crate::{
    domain::{BotId, Product},
    errors::Error,
    messaging::throttled::ThrottleConfig,
    pipeline::PipelineConfig,
    scheduler::Schedule,
    Result,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BotConfig {
    pub id: BotId,
    pub token: String,
}

/// Typed configuration, read from the environment (and `.env`).
#[derive(Clone, Debug)]
pub struct Config {
    // Telegram
    pub bots: Vec<BotConfig>,

    // Storage
    pub database_path: PathBuf,

    // Bus
    pub request_topic: String,
    pub response_topic: String,
    pub consumer_group: String,
    pub bus_poll_interval: Duration,

    // Texts
    pub placeholder_text: Option<String>,
    pub reply_failure_text: String,
    pub expiry_text: String,

    // Payments
    pub premium: Product,

    // Scheduling
    pub timezone: Tz,
    pub expiry_schedule: Schedule,
    pub push_schedule: Schedule,
    pub push_text: Option<String>,
    pub push_only_unpaid: bool,

    // Alerts
    pub alert_chat_id: Option<i64>,
    pub alert_bot_id: Option<BotId>,
    pub alert_webhook_url: Option<String>,

    // Telegram flood control
    pub throttle: ThrottleConfig,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. `load` uses the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let vars = Vars(&lookup);

        let bots = parse_bots(vars.str("TELEGRAM_BOTS"), vars.str("TELEGRAM_BOT_TOKEN"))?;
        if bots.is_empty() {
            return Err(Error::Config(
                "TELEGRAM_BOT_TOKEN or TELEGRAM_BOTS environment variable is required".to_string(),
            ));
        }

        let database_path = vars
            .non_empty("DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("rtb.sqlite3"));

        let request_topic = vars
            .non_empty("BUS_REQUEST_TOPIC")
            .unwrap_or_else(|| "rag.requests".to_string());
        let response_topic = vars
            .non_empty("BUS_RESPONSE_TOPIC")
            .unwrap_or_else(|| "rag.responses".to_string());
        if request_topic == response_topic {
            return Err(Error::Config(
                "BUS_REQUEST_TOPIC and BUS_RESPONSE_TOPIC must differ".to_string(),
            ));
        }
        let consumer_group = vars
            .non_empty("BUS_CONSUMER_GROUP")
            .unwrap_or_else(|| "rtb".to_string());
        let bus_poll_interval =
            Duration::from_millis(vars.u64("BUS_POLL_INTERVAL_MS").unwrap_or(500).max(10));

        // An explicitly empty PLACEHOLDER_TEXT disables the placeholder.
        let placeholder_text = match vars.str("PLACEHOLDER_TEXT") {
            Some(s) => non_empty(s),
            None => Some("Thinking…".to_string()),
        };
        let reply_failure_text = vars.non_empty("REPLY_FAILURE_TEXT").unwrap_or_else(|| {
            "Sorry, I could not prepare an answer. Please try again later.".to_string()
        });
        let expiry_text = vars.non_empty("EXPIRY_TEXT").unwrap_or_else(|| {
            "Your premium subscription has expired. Use /buy to renew it.".to_string()
        });

        let premium = Product {
            id: vars
                .non_empty("PREMIUM_PRODUCT_ID")
                .unwrap_or_else(|| "premium_30d".to_string()),
            title: vars
                .non_empty("PREMIUM_TITLE")
                .unwrap_or_else(|| "Premium".to_string()),
            description: vars
                .non_empty("PREMIUM_DESCRIPTION")
                .unwrap_or_else(|| "30 days of premium answers".to_string()),
            amount: vars.i64("PREMIUM_PRICE").unwrap_or(100),
            currency: vars
                .non_empty("PREMIUM_CURRENCY")
                .unwrap_or_else(|| "XTR".to_string())
                .to_uppercase(),
            duration_days: vars.u32("PREMIUM_DURATION_DAYS").unwrap_or(30),
        };
        if premium.amount <= 0 {
            return Err(Error::Config("PREMIUM_PRICE must be positive".to_string()));
        }
        if premium.duration_days == 0 {
            return Err(Error::Config(
                "PREMIUM_DURATION_DAYS must be positive".to_string(),
            ));
        }

        let tz_name = vars
            .non_empty("SCHEDULE_TIMEZONE")
            .unwrap_or_else(|| "Europe/Moscow".to_string());
        let timezone: Tz = tz_name
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("unknown SCHEDULE_TIMEZONE: {tz_name}")))?;
        let expiry_schedule = Schedule::parse(
            &parse_list(vars.str("EXPIRY_CRON"), ';').unwrap_or_else(|| vec!["0 10 * * 1".to_string()]),
            timezone,
        )?;
        let push_schedule = Schedule::parse(
            &parse_list(vars.str("PUSH_CRON"), ';')
                .unwrap_or_else(|| vec!["0 13 * * 3".to_string(), "0 9 * * 0".to_string()]),
            timezone,
        )?;
        let push_text = vars.non_empty("PUSH_TEXT");
        let push_only_unpaid = vars.bool("PUSH_ONLY_UNPAID").unwrap_or(true);

        let alert_chat_id = vars.i64("ALERT_CHAT_ID");
        let alert_bot_id = vars.non_empty("ALERT_BOT_ID").map(BotId::new);
        if let Some(bot) = &alert_bot_id {
            if !bots.iter().any(|b| &b.id == bot) {
                return Err(Error::Config(format!("ALERT_BOT_ID `{bot}` is not a configured bot")));
            }
        }
        let alert_webhook_url = vars.non_empty("ALERT_WEBHOOK_URL");

        let defaults = ThrottleConfig::default();
        let throttle = ThrottleConfig {
            global_min_interval: vars
                .u64("THROTTLE_GLOBAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.global_min_interval),
            per_chat_min_interval: vars
                .u64("THROTTLE_PER_CHAT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.per_chat_min_interval),
        };

        Ok(Self {
            bots,
            database_path,
            request_topic,
            response_topic,
            consumer_group,
            bus_poll_interval,
            placeholder_text,
            reply_failure_text,
            expiry_text,
            premium,
            timezone,
            expiry_schedule,
            push_schedule,
            push_text,
            push_only_unpaid,
            alert_chat_id,
            alert_bot_id,
            alert_webhook_url,
            throttle,
        })
    }

    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            request_topic: self.request_topic.clone(),
            placeholder_text: self.placeholder_text.clone(),
            failure_text: self.reply_failure_text.clone(),
        }
    }

    /// Bot used for operator alerts: `ALERT_BOT_ID`, else the first bot.
    pub fn alert_bot(&self) -> Option<&BotId> {
        self.alert_bot_id
            .as_ref()
            .or_else(|| self.bots.first().map(|b| &b.id))
    }
}

struct Vars<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Vars<'_> {
    fn str(&self, key: &str) -> Option<String> {
        (self.0)(key)
    }

    fn non_empty(&self, key: &str) -> Option<String> {
        self.str(key).and_then(non_empty)
    }

    fn bool(&self, key: &str) -> Option<bool> {
        self.str(key).map(|s| {
            matches!(
                s.trim().to_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
    }

    fn u64(&self, key: &str) -> Option<u64> {
        self.str(key).and_then(|s| s.trim().parse::<u64>().ok())
    }

    fn u32(&self, key: &str) -> Option<u32> {
        self.str(key).and_then(|s| s.trim().parse::<u32>().ok())
    }

    fn i64(&self, key: &str) -> Option<i64> {
        self.str(key).and_then(|s| s.trim().parse::<i64>().ok())
    }
}

/// `TELEGRAM_BOTS=id:token,id:token` wins over the single `TELEGRAM_BOT_TOKEN`
/// (which registers bot `main`). Tokens contain `:` themselves, so only the
/// first one separates the id.
fn parse_bots(multi: Option<String>, single: Option<String>) -> Result<Vec<BotConfig>> {
    if let Some(multi) = multi.and_then(non_empty) {
        let mut bots: Vec<BotConfig> = Vec::new();
        for entry in multi.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let Some((id, token)) = entry.split_once(':') else {
                return Err(Error::Config(format!(
                    "TELEGRAM_BOTS entry `{id}` must look like id:token",
                    id = entry.chars().take(16).collect::<String>()
                )));
            };
            let (id, token) = (id.trim(), token.trim());
            if id.is_empty() || token.is_empty() {
                return Err(Error::Config("TELEGRAM_BOTS entry has an empty id or token".to_string()));
            }
            if bots.iter().any(|b| b.id.as_str() == id) {
                return Err(Error::Config(format!("duplicate bot id `{id}` in TELEGRAM_BOTS")));
            }
            bots.push(BotConfig {
                id: BotId::new(id),
                token: token.to_string(),
            });
        }
        return Ok(bots);
    }

    Ok(single
        .and_then(non_empty)
        .map(|token| BotConfig {
            id: BotId::new("main"),
            token: token.trim().to_string(),
        })
        .into_iter()
        .collect())
}

fn parse_list(v: Option<String>, sep: char) -> Option<Vec<String>> {
    let out = v?
        .split(sep)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
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
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
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
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
