use std::error::Error;
use std::io::{self, Write};

use tenant_portal::{PortalClient, VERSION};
use tokio::runtime::Runtime;

fn prompt(label: &str) -> io::Result<String> {
    print!("{} ", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

fn parse_bool(input: &str, default: bool) -> bool {
    match input.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" | "true" => true,
        "n" | "no" | "false" => false,
        _ => default,
    }
}

#[test]
#[ignore = "Requires network access, PORTAL_USERNAME/PORTAL_PASSWORD and manual input"]
fn interactive_live_portal() -> Result<(), Box<dyn Error>> {
    println!("tenant-portal {} interactive smoke test", VERSION);
    println!("Credentials are read from PORTAL_USERNAME / PORTAL_PASSWORD.");
    println!("Provide inputs when prompted. Press Enter to accept defaults.\n");

    let path_input = prompt("Page path [Deliveries/Deliveries.aspx]:")?;
    let page_path = if path_input.is_empty() {
        "Deliveries/Deliveries.aspx".to_string()
    } else {
        path_input
    };
    let selector_input = prompt("CSS selector to list [table tr]:")?;
    let selector = if selector_input.is_empty() {
        "table tr".to_string()
    } else {
        selector_input
    };
    let relogin_answer = prompt("Force a second login afterwards? (y/N):")?;

    let client = PortalClient::from_env()?;
    let runtime = Runtime::new()?;

    println!("\nLogging in via {}...", client.config().login_url);
    let token = runtime.block_on(client.login())?;
    println!("Status: {:?} (bearer token: {})", client.login_status(), token.is_some());

    println!("Fetching {}...", page_path);
    let page = runtime.block_on(client.page(&page_path))?;
    println!("Status: {}", page.response.status());
    println!("Final URL: {}", page.response.url());

    let document = page.document()?;
    println!("Title: {}", document.title().unwrap_or_default());
    let matches = document.select(&selector)?;
    println!("{} element(s) match `{}`:", matches.len(), selector);
    for element in matches.iter().take(10) {
        let snippet: String = element.text.chars().take(120).collect();
        println!("  <{}> {}", element.tag, snippet);
    }

    if parse_bool(&relogin_answer, false) {
        runtime.block_on(client.force_login())?;
        println!("Forced login done: {:?}", client.login_status());
    }

    let metrics = client.metrics();
    println!(
        "\nRequests: {} ({} during login), handshakes: {}, re-authentications: {}",
        metrics.total_requests,
        metrics.login_requests,
        metrics.login_handshakes,
        metrics.reauthentications
    );
    if let Some(p95) = metrics.p95_latency {
        println!("p95 latency: {:.2}s", p95.as_secs_f64());
    }

    println!("Interactive test complete. Re-run with different inputs as needed.");
    Ok(())
}
