use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::errors::{AppError, AppResult};
use crate::query::{QueryField, QueryParams};

static STREET_THROUGH_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\D*\p{L}\D*?\d+").expect("street number regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    DropStreet,
    DropCity,
    DropPostalCode,
    SplitCityHyphen,
    CropStreetComma,
    CropStreetNumber,
    ResetWithoutCity,
    ResetWithoutPostalCode,
    ResetWithoutCountry,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrategyOutcome {
    Changed(QueryParams),
    NoChange,
}

#[derive(Debug, Clone, Copy)]
pub struct AttemptContext<'a> {
    pub original: &'a QueryParams,
    pub attempt: u32,
}

const NAMED: [(&str, Strategy); 9] = [
    ("drop_street", Strategy::DropStreet),
    ("drop_city", Strategy::DropCity),
    ("drop_postalcode", Strategy::DropPostalCode),
    ("split_city_hyphen", Strategy::SplitCityHyphen),
    ("crop_street_comma", Strategy::CropStreetComma),
    ("crop_street_number", Strategy::CropStreetNumber),
    ("reset_without_city", Strategy::ResetWithoutCity),
    ("reset_without_postalcode", Strategy::ResetWithoutPostalCode),
    ("reset_without_country", Strategy::ResetWithoutCountry),
];

impl Strategy {
    pub fn from_name(name: &str) -> AppResult<Self> {
        let wanted = name.trim();
        NAMED
            .iter()
            .find(|(known, _)| *known == wanted)
            .map(|(_, strategy)| *strategy)
            .ok_or_else(|| AppError::Config(format!("unknown strategy: {name:?}")))
    }

    pub fn name(&self) -> &'static str {
        NAMED
            .iter()
            .find(|(_, strategy)| strategy == self)
            .map(|(name, _)| *name)
            .unwrap_or("unnamed")
    }

    pub fn apply(&self, current: &QueryParams, context: &AttemptContext<'_>) -> StrategyOutcome {
        match self {
            Strategy::DropStreet => drop_field(current, QueryField::Street),
            Strategy::DropCity => drop_field(current, QueryField::City),
            Strategy::DropPostalCode => drop_field(current, QueryField::PostalCode),
            Strategy::SplitCityHyphen => rewrite_field(current, QueryField::City, |city| {
                city.split_once('-').map(|(head, _)| head.to_string())
            }),
            Strategy::CropStreetComma => rewrite_field(current, QueryField::Street, |street| {
                street.split_once(',').map(|(head, _)| head.to_string())
            }),
            Strategy::CropStreetNumber => rewrite_field(current, QueryField::Street, |street| {
                STREET_THROUGH_NUMBER
                    .find(street)
                    .map(|found| found.as_str().to_string())
            }),
            Strategy::ResetWithoutCity => {
                StrategyOutcome::Changed(context.original.clone().without(QueryField::City))
            }
            Strategy::ResetWithoutPostalCode => {
                StrategyOutcome::Changed(context.original.clone().without(QueryField::PostalCode))
            }
            Strategy::ResetWithoutCountry => StrategyOutcome::Changed(
                context
                    .original
                    .clone()
                    .without(QueryField::Country)
                    .without(QueryField::CountryCode),
            ),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn drop_field(current: &QueryParams, field: QueryField) -> StrategyOutcome {
    if current.contains(field) {
        StrategyOutcome::Changed(current.clone().without(field))
    } else {
        StrategyOutcome::NoChange
    }
}

fn rewrite_field<F>(current: &QueryParams, field: QueryField, rewrite: F) -> StrategyOutcome
where
    F: FnOnce(&str) -> Option<String>,
{
    let Some(value) = current.get(field) else {
        return StrategyOutcome::NoChange;
    };
    match rewrite(value) {
        Some(next) if !next.trim().is_empty() && next.trim() != value => {
            StrategyOutcome::Changed(current.clone().with(field, &next))
        }
        _ => StrategyOutcome::NoChange,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyChain {
    steps: Vec<Strategy>,
}

impl StrategyChain {
    pub fn new(steps: Vec<Strategy>) -> Self {
        Self { steps }
    }

    pub fn from_names<S: AsRef<str>>(names: &[S]) -> AppResult<Self> {
        names
            .iter()
            .map(|name| Strategy::from_name(name.as_ref()))
            .collect::<AppResult<Vec<_>>>()
            .map(Self::new)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Strategy> {
        self.steps.iter()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl Default for StrategyChain {
    fn default() -> Self {
        Self::new(vec![
            Strategy::DropStreet,
            Strategy::DropCity,
            Strategy::DropPostalCode,
            Strategy::SplitCityHyphen,
        ])
    }
}
