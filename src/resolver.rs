use tracing::{debug, trace};

use crate::client::{ClientStats, QueryClient};
use crate::errors::AppResult;
use crate::ingestion::StandardizedRecord;
use crate::normalize::{normalize, RuleProvider};
use crate::query::{CountryTarget, GeocodeResult, QueryParams};
use crate::strategy::{AttemptContext, StrategyChain, StrategyOutcome};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Success {
        result: GeocodeResult,
        query: String,
        attempts: u32,
    },
    // `last_query` is None when the record had no address to ask about.
    Exhausted {
        last_query: Option<String>,
        attempts: u32,
    },
}

impl Resolution {
    pub fn attempts(&self) -> u32 {
        match self {
            Resolution::Success { attempts, .. } | Resolution::Exhausted { attempts, .. } => {
                *attempts
            }
        }
    }
}

enum State {
    Building,
    Querying(QueryParams),
    Retrying,
}

pub struct Resolver {
    client: QueryClient,
    target: CountryTarget,
    chain: StrategyChain,
    rules: RuleProvider,
}

impl Resolver {
    pub fn new(
        client: QueryClient,
        target: CountryTarget,
        chain: StrategyChain,
        rules: RuleProvider,
    ) -> Self {
        Self {
            client,
            target,
            chain,
            rules,
        }
    }

    pub fn initial_query(&self, record: &StandardizedRecord) -> QueryParams {
        QueryParams::for_address(
            &normalize(&record.street, &self.rules),
            &normalize(&record.city, &self.rules),
            &record.postalcode,
            &self.target,
        )
    }

    // Transport failures come back as errors for the caller to count.
    pub async fn resolve(&self, record: &StandardizedRecord) -> AppResult<Resolution> {
        let mut original = QueryParams::default();
        let mut current = QueryParams::default();
        let mut last_query = None;
        let mut attempts = 0;
        let mut steps = self.chain.iter();
        let mut state = State::Building;

        loop {
            state = match state {
                State::Building => {
                    original = self.initial_query(record);
                    if !original.has_address() {
                        debug!(code = %record.code, "record has no address to geocode");
                        return Ok(Resolution::Exhausted {
                            last_query: None,
                            attempts: 0,
                        });
                    }
                    State::Querying(original.clone())
                }
                State::Querying(params) => {
                    attempts += 1;
                    let query = params.assemble();
                    let lookup = self.client.fetch(&query).await?;
                    if let Some(result) = lookup.result {
                        trace!(code = %record.code, attempts, %query, source = ?lookup.source, "resolved");
                        return Ok(Resolution::Success {
                            result,
                            query,
                            attempts,
                        });
                    }
                    last_query = Some(query);
                    current = params;
                    State::Retrying
                }
                State::Retrying => {
                    let Some(strategy) = steps.next() else {
                        return Ok(Resolution::Exhausted {
                            last_query,
                            attempts,
                        });
                    };
                    let context = AttemptContext {
                        original: &original,
                        attempt: attempts,
                    };
                    match strategy.apply(&current, &context) {
                        StrategyOutcome::Changed(next) => {
                            trace!(code = %record.code, %strategy, "applying strategy");
                            State::Querying(next)
                        }
                        StrategyOutcome::NoChange => {
                            trace!(code = %record.code, %strategy, "strategy changes nothing; skipped");
                            State::Retrying
                        }
                    }
                }
            };
        }
    }

    pub fn client_stats(&self) -> ClientStats {
        self.client.stats()
    }

    pub fn target(&self) -> &CountryTarget {
        &self.target
    }
}
