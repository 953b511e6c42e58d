//! Daily stay-home decisions.
//!
//! An [`Oracle`] answers, for one agent and one day, whether the agent stays
//! home. Oracles may fail; callers map any [`OracleError`] to a fair coin
//! flip with [`fallback_choice`].

use crate::config::{OracleConfig, OracleKind};
use crate::model::Profile;
use anyhow::{Context, Result};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha12Rng;
use reqwest::{StatusCode, blocking::Client};
use serde::{Deserialize, Serialize};
use std::{env, thread, time::Duration};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Choice {
    StayHome,
    GoOutside,
}

impl Choice {
    pub fn label(&self) -> &'static str {
        match self {
            Choice::StayHome => "stay home",
            Choice::GoOutside => "go outside",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub choice: Choice,
    pub rationale: String,
}

/// Everything an oracle is told about one agent on one day.
#[derive(Debug, Clone)]
pub struct Query {
    pub agent_id: usize,
    pub day: usize,
    pub profile: Profile,
    pub narrative: String,
    /// Share of the population on their fourth infected day yesterday, in percent.
    pub day4_percent: f64,
}

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("oracle request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("oracle request timed out")]
    Timeout,
    #[error("oracle answered with status {0}")]
    Status(StatusCode),
    #[error("malformed oracle reply: {0}")]
    Malformed(String),
}

pub trait Oracle: Send + Sync {
    fn decide(&self, query: &Query) -> Result<Decision, OracleError>;
}

/// Unbiased coin flip used whenever an oracle gives no usable answer.
pub fn fallback_choice<R: Rng>(rng: &mut R) -> Choice {
    if rng.random_bool(0.5) {
        Choice::StayHome
    } else {
        Choice::GoOutside
    }
}

/// Build the oracle selected by the configuration.
pub fn from_config(cfg: &OracleConfig) -> Result<Box<dyn Oracle>> {
    let oracle: Box<dyn Oracle> = match cfg.kind {
        OracleKind::AlwaysHome => Box::new(AlwaysHome),
        OracleKind::AlwaysOutside => Box::new(AlwaysOutside),
        OracleKind::Random => Box::new(SeededRandom::new(cfg.seed)),
        OracleKind::Chat => Box::new(ChatOracle::new(cfg).context("failed to construct chat oracle")?),
    };
    Ok(oracle)
}

pub struct AlwaysHome;

impl Oracle for AlwaysHome {
    fn decide(&self, _query: &Query) -> Result<Decision, OracleError> {
        Ok(Decision {
            choice: Choice::StayHome,
            rationale: "always stays home".to_string(),
        })
    }
}

pub struct AlwaysOutside;

impl Oracle for AlwaysOutside {
    fn decide(&self, _query: &Query) -> Result<Decision, OracleError> {
        Ok(Decision {
            choice: Choice::GoOutside,
            rationale: "always goes outside".to_string(),
        })
    }
}

/// Random choices that depend only on the seed, the agent and the day,
/// so answers do not depend on the order queries are served in.
pub struct SeededRandom {
    seed: u64,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }
}

impl Oracle for SeededRandom {
    fn decide(&self, query: &Query) -> Result<Decision, OracleError> {
        let stream = (query.agent_id as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
            ^ (query.day as u64).rotate_left(32);
        let mut rng = ChaCha12Rng::seed_from_u64(self.seed ^ stream);
        Ok(Decision {
            choice: fallback_choice(&mut rng),
            rationale: "random choice".to_string(),
        })
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

/// Client for an OpenAI-compatible chat completions endpoint.
///
/// Retries with exponential backoff on rate limiting, server errors and
/// connection failures. Timed out calls are not retried.
pub struct ChatOracle {
    client: Client,
    endpoint: String,
    model: String,
    api_key: String,
    max_retries: u32,
}

const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

impl ChatOracle {
    /// Build a client authenticated with `OPENAI_API_KEY`.
    pub fn new(cfg: &OracleConfig) -> Result<Self> {
        let api_key = env::var("OPENAI_API_KEY").context("OPENAI_API_KEY is not set")?;
        Self::with_api_key(cfg, api_key)
    }

    pub fn with_api_key(cfg: &OracleConfig, api_key: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            client,
            endpoint: cfg.endpoint.clone(),
            model: cfg.model.clone(),
            api_key,
            max_retries: cfg.max_retries,
        })
    }

    fn complete(&self, prompt: &str) -> Result<String, OracleError> {
        let body = serde_json::json!({
            "model": self.model,
            "temperature": 0,
            "messages": [{ "role": "developer", "content": prompt }],
        });

        let mut attempt = 0;
        loop {
            let result = self
                .client
                .post(&self.endpoint)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send();

            let retryable = match result {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let reply: ChatResponse = response.json()?;
                        return reply
                            .choices
                            .into_iter()
                            .next()
                            .map(|choice| choice.message.content)
                            .ok_or_else(|| OracleError::Malformed("no choices".to_string()));
                    }
                    if status != StatusCode::TOO_MANY_REQUESTS && !status.is_server_error() {
                        return Err(OracleError::Status(status));
                    }
                    OracleError::Status(status)
                }
                Err(error) if error.is_timeout() => return Err(OracleError::Timeout),
                Err(error) if error.is_connect() => OracleError::Transport(error),
                Err(error) => return Err(OracleError::Transport(error)),
            };

            if attempt >= self.max_retries {
                return Err(retryable);
            }
            let delay = BACKOFF_BASE
                .saturating_mul(1 << attempt.min(16))
                .min(BACKOFF_MAX);
            log::info!("{retryable}; retrying in {delay:?}");
            thread::sleep(delay);
            attempt += 1;
        }
    }
}

impl Oracle for ChatOracle {
    fn decide(&self, query: &Query) -> Result<Decision, OracleError> {
        let reply = self.complete(&build_prompt(query))?;
        parse_reply(&reply)
    }
}

fn build_prompt(query: &Query) -> String {
    let profile = &query.profile;
    let [t0, t1, t2, t3, t4] = &profile.traits;
    format!(
        "You are {name}. You are {age} years old. You are a person who is {t0}, {t1}, {t2}, {t3}, and {t4}.\n\
         You live in the town of Dewberry Hollow. You have a job and go to the office for work everyday.\n\
         {narrative}\n\
         You go to work to earn money to support yourself.\n\
         You know about the Catasat virus spreading across the country. It is an airborne virus causing an infectious disease that spreads from human to human. The deadliness of the virus is unknown.\n\
         You check the newspaper and find that {pct:.1}% of Dewberry Hollow's population were diagnosed with new infections of the Catasat virus yesterday.\n\
         Should you stay at home for the entire day? Please provide your reasoning.\n\n\
         The format should be as follows:\n\
         Reasoning: [explanation]\n\
         Response: [Yes or No]\n\n\
         You have to provide Response in a single word; it must be either \"Yes\" or \"No\".",
        name = profile.name,
        age = profile.age,
        narrative = query.narrative,
        pct = query.day4_percent,
    )
}

/// Parse a `Reasoning: ... Response: Yes|No` reply.
///
/// "Yes" means the agent stays home. The response word is read up to the
/// first period and compared case-insensitively.
pub fn parse_reply(text: &str) -> Result<Decision, OracleError> {
    let (_, rest) = text
        .split_once("Reasoning:")
        .ok_or_else(|| OracleError::Malformed("missing reasoning".to_string()))?;
    let (reasoning, response) = rest
        .split_once("Response:")
        .ok_or_else(|| OracleError::Malformed("missing response".to_string()))?;

    let word = response.trim().split('.').next().unwrap_or("").trim();
    let choice = match word.to_lowercase().as_str() {
        "yes" => Choice::StayHome,
        "no" => Choice::GoOutside,
        _ => return Err(OracleError::Malformed(format!("unexpected response {word:?}"))),
    };

    Ok(Decision {
        choice,
        rationale: reasoning.trim().to_string(),
    })
}
