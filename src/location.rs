//! Coarse location from the public IP, doubling as the startup connectivity check.

use std::time::Duration;

use serde::Deserialize;
use tracing::error;

pub const LOCATION_URL: &str = "http://ip-api.com/json/";
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct IpLocation {
    city: Option<String>,
    country: Option<String>,
}

impl IpLocation {
    fn describe(&self) -> Option<String> {
        match (&self.city, &self.country) {
            (Some(city), Some(country)) => Some(format!("{city}, {country}")),
            (None, Some(country)) => Some(country.clone()),
            (Some(city), None) => Some(city.clone()),
            (None, None) => None,
        }
    }
}

/// `"City, Country"`, or `None` when offline or the service answered nothing usable.
pub fn lookup_location(url: &str) -> Option<String> {
    let client = match reqwest::blocking::Client::builder()
        .timeout(LOOKUP_TIMEOUT)
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "http client setup failed");
            return None;
        }
    };
    let body: IpLocation = match client.get(url).send().and_then(|r| r.error_for_status()) {
        Ok(response) => match response.json() {
            Ok(body) => body,
            Err(e) => {
                error!(error = %e, "location response unreadable");
                return None;
            }
        },
        Err(e) => {
            error!(error = %e, "internet connection check failed");
            return None;
        }
    };
    body.describe()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describes_city_and_country() {
        let full: IpLocation =
            serde_json::from_str(r#"{"status":"success","city":"Plovdiv","country":"Bulgaria"}"#).unwrap();
        assert_eq!(full.describe().as_deref(), Some("Plovdiv, Bulgaria"));

        let failed: IpLocation = serde_json::from_str(r#"{"status":"fail"}"#).unwrap();
        assert_eq!(failed.describe(), None);
    }
}
