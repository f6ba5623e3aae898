//! Suggestion client: fills a Suggestion's assignment backlog from the
//! algorithm service and validates algorithm settings.

use hs_types::{
    AlgorithmError, Experiment, HsResult, RuntimeConfig, Suggestion, Trial, TrialAssignment,
    SUGGESTION_EXHAUSTED_REASON,
};
use rand::Rng;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::convert::{experiment_with_settings, merge_by_name, trials_to_wire};
use crate::service::{AlgorithmConnector, RpcCode, RpcResult, RpcStatus};
use crate::wire::{
    GetEarlyStoppingRulesRequest, GetSuggestionsRequest, ValidateAlgorithmSettingsRequest,
    ValidateEarlyStoppingSettingsRequest,
};

pub const METHOD_GET_SUGGESTIONS: &str = "GetSuggestions";
pub const METHOD_VALIDATE_ALGORITHM_SETTINGS: &str = "ValidateAlgorithmSettings";
pub const METHOD_VALIDATE_EARLY_STOPPING_SETTINGS: &str = "ValidateEarlyStoppingSettings";
pub const METHOD_GET_EARLY_STOPPING_RULES: &str = "GetEarlyStoppingRules";

const NAME_SUFFIX_LEN: usize = 8;
const NAME_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const WAIT_FOR_READY_INTERVAL: Duration = Duration::from_millis(500);

/// Connection settings of the client.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub rpc_timeout: Duration,
    pub suggestion_port: u16,
    pub early_stopping_port: u16,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::from(&RuntimeConfig::default())
    }
}

impl From<&RuntimeConfig> for ClientConfig {
    fn from(runtime: &RuntimeConfig) -> Self {
        Self {
            rpc_timeout: runtime.rpc_timeout(),
            suggestion_port: runtime.suggestion_port,
            early_stopping_port: runtime.early_stopping_port,
        }
    }
}

pub struct SuggestionClient {
    connector: Arc<dyn AlgorithmConnector>,
    config: ClientConfig,
}

impl SuggestionClient {
    pub fn new(connector: Arc<dyn AlgorithmConnector>, config: ClientConfig) -> Self {
        Self { connector, config }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// `<suggestion>-<algorithm>.<namespace>:<port>`
    pub fn suggestion_endpoint(&self, suggestion: &Suggestion) -> String {
        format!(
            "{}.{}:{}",
            suggestion.runtime_name(),
            suggestion.meta.namespace,
            self.config.suggestion_port
        )
    }

    /// The early stopping service runs next to the suggestion service.
    pub fn early_stopping_endpoint(&self, suggestion: &Suggestion) -> String {
        format!(
            "{}.{}:{}",
            suggestion.runtime_name(),
            suggestion.meta.namespace,
            self.config.early_stopping_port
        )
    }

    /// Ask the algorithm service for enough assignments to reach
    /// `spec.requests` and append them to the Suggestion status.
    ///
    /// The Suggestion is only touched once every call has succeeded; a reply
    /// with the wrong number of assignments is a protocol error.
    pub async fn sync_assignments(
        &self,
        suggestion: &mut Suggestion,
        experiment: &Experiment,
        trials: &[Trial],
    ) -> HsResult<()> {
        if suggestion.is_exhausted() {
            return Ok(());
        }
        let request_num = suggestion
            .spec
            .requests
            .saturating_sub(suggestion.status.suggestion_count);
        if request_num == 0 {
            return Ok(());
        }

        let endpoint = self.suggestion_endpoint(suggestion);
        let wire_experiment =
            experiment_with_settings(experiment, &suggestion.status.algorithm_settings);
        let wire_trials = trials_to_wire(experiment, trials);
        let request = GetSuggestionsRequest {
            experiment: wire_experiment.clone(),
            trials: wire_trials.clone(),
            current_request_number: request_num,
            total_request_number: suggestion.spec.requests,
        };

        debug!(
            suggestion = %endpoint,
            request_num,
            total = suggestion.spec.requests,
            "requesting assignments"
        );
        let service = self.connector.connect(&endpoint);
        let reply = self
            .call(METHOD_GET_SUGGESTIONS, &endpoint, service.get_suggestions(request))
            .await?;

        let received = reply.parameter_assignments.len();
        let exhausted = reply.search_exhausted && received <= request_num as usize;
        if !exhausted && received != request_num as usize {
            return Err(AlgorithmError::Protocol {
                expected: request_num as usize,
                actual: received,
            }
            .into());
        }

        let early_stopping_rules = if suggestion.spec.early_stopping_algorithm().is_some() {
            let es_endpoint = self.early_stopping_endpoint(suggestion);
            let es_service = self.connector.connect(&es_endpoint);
            let request = GetEarlyStoppingRulesRequest {
                experiment: wire_experiment,
                trials: wire_trials,
            };
            self.call(
                METHOD_GET_EARLY_STOPPING_RULES,
                &es_endpoint,
                es_service.get_early_stopping_rules(request),
            )
            .await?
            .early_stopping_rules
        } else {
            Vec::new()
        };

        let mut taken: HashSet<String> = suggestion
            .status
            .suggestions
            .iter()
            .map(|a| a.name.clone())
            .collect();
        let mut suggestions = suggestion.status.suggestions.clone();
        for set in reply.parameter_assignments {
            let name = if set.trial_name.is_empty() {
                unique_name(&suggestion.meta.name, &taken)
            } else {
                set.trial_name
            };
            taken.insert(name.clone());
            suggestions.push(TrialAssignment {
                name,
                parameter_assignments: set.assignments,
                early_stopping_rules: early_stopping_rules.clone(),
                labels: set.labels,
            });
        }

        suggestion.status.suggestion_count = suggestions.len() as u32;
        suggestion.status.suggestions = suggestions;
        if !reply.algorithm_settings.is_empty() {
            suggestion.status.algorithm_settings =
                merge_by_name(&suggestion.status.algorithm_settings, &reply.algorithm_settings);
        }
        if exhausted {
            suggestion.mark_exhausted(
                SUGGESTION_EXHAUSTED_REASON,
                "Algorithm service has no more assignments to hand out",
            );
        }

        info!(
            suggestion = %suggestion.meta.key(),
            received,
            suggestion_count = suggestion.status.suggestion_count,
            exhausted,
            "synced assignments"
        );
        Ok(())
    }

    /// Validate the Experiment's algorithm settings, waiting for the service
    /// to come up until the call deadline.
    pub async fn validate_algorithm_settings(
        &self,
        suggestion: &Suggestion,
        experiment: &Experiment,
    ) -> HsResult<()> {
        let endpoint = self.suggestion_endpoint(suggestion);
        let service = self.connector.connect(&endpoint);
        let request = ValidateAlgorithmSettingsRequest {
            experiment: crate::convert::experiment_to_wire(experiment),
        };
        self.call_when_ready(METHOD_VALIDATE_ALGORITHM_SETTINGS, &endpoint, || {
            service.validate_algorithm_settings(request.clone())
        })
        .await?;
        Ok(())
    }

    pub async fn validate_early_stopping_settings(
        &self,
        suggestion: &Suggestion,
        experiment: &Experiment,
    ) -> HsResult<()> {
        let endpoint = self.early_stopping_endpoint(suggestion);
        let service = self.connector.connect(&endpoint);
        let request = ValidateEarlyStoppingSettingsRequest {
            experiment: crate::convert::experiment_to_wire(experiment),
        };
        self.call_when_ready(METHOD_VALIDATE_EARLY_STOPPING_SETTINGS, &endpoint, || {
            service.validate_early_stopping_settings(request.clone())
        })
        .await?;
        Ok(())
    }

    async fn call<T, F>(&self, method: &str, endpoint: &str, call: F) -> Result<T, AlgorithmError>
    where
        F: Future<Output = RpcResult<T>>,
    {
        match tokio::time::timeout(self.config.rpc_timeout, call).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(status)) => Err(rpc_error(method, endpoint, status)),
            Err(_) => Err(AlgorithmError::Timeout {
                method: method.to_string(),
                timeout_seconds: self.config.rpc_timeout.as_secs(),
            }),
        }
    }

    /// Retry `attempt` while the service reports itself unavailable, then
    /// classify the outcome of a validation call.
    async fn call_when_ready<F, Fut>(
        &self,
        method: &str,
        endpoint: &str,
        mut attempt: F,
    ) -> Result<(), AlgorithmError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RpcResult<()>>,
    {
        let deadline = Instant::now() + self.config.rpc_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let status = match tokio::time::timeout(remaining, attempt()).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(status)) => status,
                Err(_) => {
                    return Err(AlgorithmError::Unavailable {
                        endpoint: endpoint.to_string(),
                        message: format!(
                            "{} did not answer within {}s",
                            method,
                            self.config.rpc_timeout.as_secs()
                        ),
                    })
                }
            };

            match status.code {
                RpcCode::Unavailable => {
                    if Instant::now() + WAIT_FOR_READY_INTERVAL >= deadline {
                        return Err(AlgorithmError::Unavailable {
                            endpoint: endpoint.to_string(),
                            message: status.message,
                        });
                    }
                    debug!(endpoint, method, "algorithm service not ready yet");
                    tokio::time::sleep(WAIT_FOR_READY_INTERVAL).await;
                }
                RpcCode::InvalidArgument | RpcCode::Unknown => {
                    return Err(AlgorithmError::Validation {
                        method: method.to_string(),
                        message: status.message,
                    });
                }
                RpcCode::Unimplemented => {
                    info!(endpoint, method, "validation not implemented by the service, skipping");
                    return Ok(());
                }
                code => {
                    warn!(endpoint, method, %code, message = %status.message, "validation call failed, treating settings as valid");
                    return Ok(());
                }
            }
        }
    }
}

fn rpc_error(method: &str, endpoint: &str, status: RpcStatus) -> AlgorithmError {
    match status.code {
        RpcCode::Unavailable => AlgorithmError::Unavailable {
            endpoint: endpoint.to_string(),
            message: status.message,
        },
        RpcCode::Cancelled => AlgorithmError::Transport {
            endpoint: endpoint.to_string(),
            message: status.message,
        },
        code => AlgorithmError::Remote {
            method: method.to_string(),
            code: code.to_string(),
            message: status.message,
        },
    }
}

/// `<prefix>-<8 random lowercase alphanumerics>`, not in `taken`.
fn unique_name(prefix: &str, taken: &HashSet<String>) -> String {
    let mut rng = rand::thread_rng();
    loop {
        let suffix: String = (0..NAME_SUFFIX_LEN)
            .map(|_| NAME_CHARSET[rng.gen_range(0..NAME_CHARSET.len())] as char)
            .collect();
        let name = format!("{}-{}", prefix, suffix);
        if !taken.contains(&name) {
            return name;
        }
    }
}
