use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use reqwest::Url;
use serde::Serialize;
use serde_json::Value;

const RESPONSE_FORMAT: &str = "json";

static QUERY_BASE: Lazy<Url> =
    Lazy::new(|| Url::parse("http://geocoder.invalid/").expect("static base url"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QueryField {
    Street,
    City,
    PostalCode,
    Country,
    CountryCode,
    Format,
}

impl QueryField {
    pub fn as_param(&self) -> &'static str {
        match self {
            QueryField::Street => "street",
            QueryField::City => "city",
            QueryField::PostalCode => "postalcode",
            QueryField::Country => "country",
            QueryField::CountryCode => "countrycodes",
            QueryField::Format => "format",
        }
    }

    fn is_address(&self) -> bool {
        matches!(
            self,
            QueryField::Street | QueryField::City | QueryField::PostalCode
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountryTarget {
    pub name: String,
    pub code: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams {
    fields: BTreeMap<QueryField, String>,
}

impl QueryParams {
    pub fn for_address(street: &str, city: &str, postalcode: &str, target: &CountryTarget) -> Self {
        Self::default()
            .with(QueryField::Street, street)
            .with(QueryField::City, city)
            .with(QueryField::PostalCode, postalcode)
            .with(QueryField::Country, &target.name)
            .with(QueryField::CountryCode, &target.code.to_lowercase())
            .with(QueryField::Format, RESPONSE_FORMAT)
    }

    // Blank values remove the field.
    pub fn with(mut self, field: QueryField, value: &str) -> Self {
        let value = value.trim();
        if value.is_empty() {
            self.fields.remove(&field);
        } else {
            self.fields.insert(field, value.to_string());
        }
        self
    }

    pub fn without(mut self, field: QueryField) -> Self {
        self.fields.remove(&field);
        self
    }

    pub fn get(&self, field: QueryField) -> Option<&str> {
        self.fields.get(&field).map(String::as_str)
    }

    pub fn contains(&self, field: QueryField) -> bool {
        self.fields.contains_key(&field)
    }

    pub fn has_address(&self) -> bool {
        self.fields.keys().any(QueryField::is_address)
    }

    // Fixed field order; the result doubles as the cache key.
    pub fn assemble(&self) -> String {
        let mut url = QUERY_BASE.clone();
        {
            let mut pairs = url.query_pairs_mut();
            for (field, value) in &self.fields {
                pairs.append_pair(field.as_param(), value);
            }
        }
        url.query().unwrap_or_default().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeocodeResult {
    pub lat: String,
    pub lng: String,
}

// First element only. Anything without usable lat and lon/lng is no match.
pub fn first_candidate(payload: &str) -> Option<GeocodeResult> {
    let candidates: Vec<Value> = serde_json::from_str(payload).ok()?;
    let first = candidates.into_iter().next()?;
    let lat = coordinate(first.get("lat")?)?;
    let lng = first
        .get("lon")
        .or_else(|| first.get("lng"))
        .and_then(coordinate)?;
    Some(GeocodeResult { lat, lng })
}

fn coordinate(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(text) => text.trim().to_string(),
        Value::Number(number) => number.to_string(),
        _ => return None,
    };
    text.parse::<f64>()
        .ok()
        .filter(|parsed| parsed.is_finite())
        .map(|_| text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finland() -> CountryTarget {
        CountryTarget {
            name: "Finland".into(),
            code: "FI".into(),
        }
    }

    #[test]
    fn omits_absent_fields_from_assembled_query() {
        let params = QueryParams::for_address("", "Helsinki", "00100", &finland());
        assert!(!params.contains(QueryField::Street));
        assert_eq!(
            params.assemble(),
            "city=Helsinki&postalcode=00100&country=Finland&countrycodes=fi&format=json"
        );
    }

    #[test]
    fn encodes_values_in_assembled_query() {
        let params = QueryParams::for_address("Main St, Suite 2", "", "", &finland());
        assert!(params
            .assemble()
            .starts_with("street=Main+St%2C+Suite+2&country=Finland"));
    }

    #[test]
    fn address_presence_ignores_country_fields() {
        let params = QueryParams::for_address(" ", "", "", &finland());
        assert!(!params.has_address());
        assert!(params.contains(QueryField::Country));
    }

    #[test]
    fn takes_first_candidate_without_ranking() {
        let payload = r#"[{"lat":"60.17","lon":"24.94"},{"lat":"61.0","lon":"25.0"}]"#;
        assert_eq!(
            first_candidate(payload),
            Some(GeocodeResult {
                lat: "60.17".into(),
                lng: "24.94".into()
            })
        );
    }

    #[test]
    fn accepts_numeric_and_lng_keys() {
        let payload = r#"[{"lat":45.81,"lng":15.98}]"#;
        let result = first_candidate(payload).unwrap();
        assert_eq!(result.lat, "45.81");
        assert_eq!(result.lng, "15.98");
    }

    #[test]
    fn malformed_payloads_count_as_no_match() {
        assert_eq!(first_candidate("[]"), None);
        assert_eq!(first_candidate(""), None);
        assert_eq!(first_candidate(r#"{"error":"Unable to geocode"}"#), None);
        assert_eq!(first_candidate(r#"[{"lat":"60.17"}]"#), None);
        assert_eq!(first_candidate(r#"[{"lat":"north","lon":"24.94"}]"#), None);
    }
}
