use std::fmt;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::model::ModelLeg;
use crate::unit::{Batch, InferenceUnit};

/// Language every model in the repository is trained to or from.
pub const PIVOT_LANGUAGE: &str = "en";

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LanguagePair {
    pub source: String,
    pub target: String,
}

impl LanguagePair {
    pub fn new(source: &str, target: &str) -> Self {
        Self {
            source: source.to_string(),
            target: target.to_string(),
        }
    }

    /// Compact directory-style key, e.g. `esen`.
    pub fn key(&self) -> String {
        format!("{}{}", self.source, self.target)
    }
}

impl fmt::Display for LanguagePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source, self.target)
    }
}

/// Model legs needed for `pair`: the pair itself when either side is the pivot, otherwise
/// `(source, pivot)` followed by `(pivot, target)`.
pub fn plan_legs(pair: &LanguagePair, pivot: &str) -> Vec<LanguagePair> {
    if pair.source == pivot || pair.target == pivot {
        vec![pair.clone()]
    } else {
        vec![
            LanguagePair::new(&pair.source, pivot),
            LanguagePair::new(pivot, &pair.target),
        ]
    }
}

/// Checks that a list of legs chains into one logical pair and returns that pair.
pub fn validate_chain(legs: &[LanguagePair]) -> EngineResult<LanguagePair> {
    match legs {
        [only] => Ok(only.clone()),
        [first, second] => {
            if first.target != second.source {
                return Err(EngineError::configuration(format!(
                    "pivot legs do not chain: {first} then {second}"
                )));
            }
            Ok(LanguagePair::new(&first.source, &second.target))
        }
        other => Err(EngineError::configuration(format!(
            "expected one or two translation models, got {}",
            other.len()
        ))),
    }
}

/// Issues the direct or pivot translate call for the given legs. The returned response batch is
/// released when dropped.
pub fn dispatch(
    unit: &std::sync::Arc<dyn InferenceUnit>,
    legs: &[ModelLeg],
    messages: &Batch,
    options: &Batch,
) -> EngineResult<Batch> {
    let responses = match legs {
        [leg] => {
            debug!(pair = %leg.pair(), "direct translation");
            unit.translate(leg.handle(), messages.handle(), options.handle())
                .with_context(|| format!("translate {}", leg.pair()))
        }
        [first, second] => {
            debug!(first = %first.pair(), second = %second.pair(), "pivot translation");
            unit.translate_via_pivot(
                first.handle(),
                second.handle(),
                messages.handle(),
                options.handle(),
            )
            .with_context(|| {
                format!(
                    "translate {} -> {} via {}",
                    first.pair().source,
                    second.pair().target,
                    first.pair().target
                )
            })
        }
        other => {
            return Err(EngineError::Internal(format!(
                "too many models were provided to the translation worker: {}",
                other.len()
            )))
        }
    };
    responses
        .map(|handle| Batch::adopt(unit, handle))
        .map_err(|err| EngineError::translation(&err))
}

#[cfg(test)]
mod tests {
    use super::{dispatch, plan_legs, validate_chain, LanguagePair, PIVOT_LANGUAGE};
    use crate::error::EngineError;
    use crate::mock::{leg_payload, MockLoader};
    use crate::model::assemble;
    use crate::unit::{Batch, ResponseOptions};

    #[test]
    fn pivot_side_gets_one_leg() {
        let legs = plan_legs(&LanguagePair::new("es", "en"), PIVOT_LANGUAGE);
        assert_eq!(legs, vec![LanguagePair::new("es", "en")]);

        let legs = plan_legs(&LanguagePair::new("en", "zh"), PIVOT_LANGUAGE);
        assert_eq!(legs, vec![LanguagePair::new("en", "zh")]);
    }

    #[test]
    fn non_pivot_pair_gets_two_ordered_legs() {
        let legs = plan_legs(&LanguagePair::new("es", "fr"), PIVOT_LANGUAGE);
        assert_eq!(
            legs,
            vec![LanguagePair::new("es", "en"), LanguagePair::new("en", "fr")]
        );
    }

    #[test]
    fn chain_validation() {
        let pair = validate_chain(&[LanguagePair::new("zh", "en"), LanguagePair::new("en", "es")])
            .expect("chain");
        assert_eq!(pair, LanguagePair::new("zh", "es"));

        let err = validate_chain(&[LanguagePair::new("zh", "en"), LanguagePair::new("de", "es")])
            .unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));

        for n in [0usize, 3] {
            let legs = vec![LanguagePair::new("a", "b"); n];
            assert!(matches!(
                validate_chain(&legs),
                Err(EngineError::Configuration(_))
            ));
        }
    }

    #[test]
    fn pair_key_and_display() {
        let pair = LanguagePair::new("es", "en");
        assert_eq!(pair.key(), "esen");
        assert_eq!(pair.to_string(), "es -> en");
    }

    #[test]
    fn pivot_failure_names_the_whole_route() {
        let loader = MockLoader::default().fail_translate_on("boom");
        let unit = loader.unit();
        let legs = vec![
            assemble(&unit, &leg_payload("es", "en")).expect("es-en"),
            assemble(&unit, &leg_payload("en", "fr")).expect("en-fr"),
        ];
        let messages = Batch::messages(&unit, &["boom"]).expect("messages");
        let options = Batch::options(&unit, &[ResponseOptions::for_request(false)]).expect("options");

        let err = dispatch(&unit, &legs, &messages, &options).unwrap_err();
        match err {
            EngineError::Translation { message, .. } => {
                assert!(message.contains("translate es -> fr via en"), "{message}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
