use std::env;
use std::error;

use reqwest::Url;

/// Liveness probe: GET the given URL (the service's `/health` route by
/// default) and fail loudly on anything but a success status.
fn main() -> Result<(), Box<dyn error::Error>> {
    let args: Vec<String> = env::args().collect();
    let raw_url = args
        .get(1)
        .map_or("http://127.0.0.1:8080/health", String::as_str);

    let url = Url::parse(raw_url)?;
    let body = reqwest::blocking::get(url)?;
    if !body.status().is_success() {
        return Err(format!("Health check failed with status {}", body.status()).into());
    }

    Ok(())
}
