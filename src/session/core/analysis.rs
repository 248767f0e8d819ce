//! Login page parsing helpers.
//!
//! Provides the building blocks needed to inspect the portal's login markup and
//! extract what the handshake has to echo back: the form action, its hidden
//! fields (anti-forgery token, view state) and the names of the credential
//! inputs.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use url::Url;

use super::types::LoginSubmission;

/// Minimal snapshot of the login form used by the handshake.
#[derive(Debug, Clone)]
pub struct LoginFormBlueprint {
    pub action: String,
    pub hidden_fields: Vec<(String, String)>,
    pub username_field: Option<String>,
    pub password_field: Option<String>,
}

/// Field names the caller wants to enforce instead of relying on detection.
#[derive(Debug, Clone, Default)]
pub struct LoginFormHints {
    pub username_field: Option<String>,
    pub password_field: Option<String>,
    pub anti_forgery_field: Option<String>,
}

impl LoginFormBlueprint {
    /// Anti-forgery token value, if the form carries the named hidden field.
    pub fn hidden_value(&self, name: &str) -> Option<&str> {
        self.hidden_fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn to_submission(
        self,
        page_url: &Url,
        hints: &LoginFormHints,
        username: &str,
        password: &str,
    ) -> Result<LoginSubmission, LoginFormError> {
        let username_field = hints
            .username_field
            .clone()
            .or(self.username_field)
            .ok_or(LoginFormError::MissingInput("username"))?;
        let password_field = hints
            .password_field
            .clone()
            .or(self.password_field)
            .ok_or(LoginFormError::MissingInput("password"))?;

        let mut form_fields: HashMap<String, String> = self.hidden_fields.into_iter().collect();
        form_fields.insert(username_field, username.to_string());
        form_fields.insert(password_field, password.to_string());

        let submit_url = if self.action.trim().is_empty() {
            page_url.clone()
        } else {
            page_url
                .join(self.action.trim())
                .map_err(|err| LoginFormError::InvalidAction(self.action.clone(), err))?
        };

        Ok(LoginSubmission::new(submit_url, form_fields)
            .with_header("Content-Type", "application/x-www-form-urlencoded")
            .with_header("Referer", page_url.as_str())
            .with_header("Origin", origin_from_url(page_url)))
    }
}

/// Reasons the login markup could not be turned into a submission. These mean
/// the site changed, not that the credentials are wrong.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LoginFormError {
    #[error("unable to locate a login form with a password input")]
    FormNotFound,
    #[error("login form is missing the anti-forgery field '{0}'")]
    MissingToken(String),
    #[error("unable to identify the {0} input of the login form")]
    MissingInput(&'static str),
    #[error("invalid login form action '{0}': {1}")]
    InvalidAction(String, url::ParseError),
}

static FORM_SELECTOR: Lazy<Selector> = Lazy::new(|| selector("form"));
static INPUT_SELECTOR: Lazy<Selector> = Lazy::new(|| selector("input"));
static PASSWORD_SELECTOR: Lazy<Selector> = Lazy::new(|| selector("input[type=password]"));
static VALIDATION_SELECTOR: Lazy<Selector> = Lazy::new(|| {
    selector(
        ".validation-summary-errors, .field-validation-error, .alert-danger, .error-message, #ErrorMessage",
    )
});

fn selector(raw: &str) -> Selector {
    Selector::parse(raw).unwrap_or_else(|err| panic!("invalid built-in selector `{raw}`: {err:?}"))
}

/// Extract the login form blueprint from the login page body.
///
/// The form is the first `<form>` that contains a password input. When an
/// anti-forgery field name is given it must be present among the form's
/// inputs (or anywhere in the document, which covers ASP.NET pages that
/// render the token outside the form element).
pub fn parse_login_form(
    body: &str,
    hints: &LoginFormHints,
) -> Result<LoginFormBlueprint, LoginFormError> {
    let document = Html::parse_document(body);

    let form = document
        .select(&FORM_SELECTOR)
        .find(|form| form.select(&PASSWORD_SELECTOR).next().is_some())
        .ok_or(LoginFormError::FormNotFound)?;

    let action = form.value().attr("action").unwrap_or("").to_string();
    let mut hidden_fields = Vec::new();
    let mut username_field = None;
    let mut password_field = None;

    for input in form.select(&INPUT_SELECTOR) {
        let Some(name) = input.value().attr("name").filter(|name| !name.is_empty()) else {
            continue;
        };
        let kind = input
            .value()
            .attr("type")
            .unwrap_or("text")
            .to_ascii_lowercase();

        match kind.as_str() {
            "hidden" => {
                let value = input.value().attr("value").unwrap_or("").to_string();
                hidden_fields.push((name.to_string(), value));
            }
            "password" if password_field.is_none() => {
                password_field = Some(name.to_string());
            }
            "text" | "email" if username_field.is_none() => {
                username_field = Some(name.to_string());
            }
            _ => {}
        }
    }

    if let Some(token_field) = hints.anti_forgery_field.as_deref()
        && !hidden_fields.iter().any(|(name, _)| name == token_field)
    {
        let token = find_named_input(&document, token_field)
            .ok_or_else(|| LoginFormError::MissingToken(token_field.to_string()))?;
        hidden_fields.push((token_field.to_string(), token));
    }

    Ok(LoginFormBlueprint {
        action,
        hidden_fields,
        username_field,
        password_field,
    })
}

fn find_named_input(document: &Html, name: &str) -> Option<String> {
    document
        .select(&INPUT_SELECTOR)
        .find(|input| input.value().attr("name") == Some(name))
        .map(|input| input.value().attr("value").unwrap_or("").to_string())
}

/// Whether the page still renders a login form (credentials re-prompted).
pub fn contains_login_form(body: &str) -> bool {
    let document = Html::parse_document(body);
    document
        .select(&FORM_SELECTOR)
        .any(|form| form.select(&PASSWORD_SELECTOR).next().is_some())
}

/// First validation message rendered on a rejected login page.
pub fn validation_message(body: &str) -> Option<String> {
    let document = Html::parse_document(body);
    document
        .select(&VALIDATION_SELECTOR)
        .map(element_text)
        .find(|text| !text.is_empty())
}

fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .map(str::trim)
        .filter(|chunk| !chunk.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

static ACCESS_TOKEN_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r#"["']?(?:access_token|accessToken)["']?\s*[:=]\s*["'](?P<token>[^"']{8,})["']"#)
        .case_insensitive(true)
        .build()
        .unwrap_or_else(|err| panic!("invalid access token regex: {err}"))
});

/// Locate a bearer token embedded in the landing page script.
pub fn locate_access_token(body: &str) -> Option<String> {
    ACCESS_TOKEN_RE
        .captures(body)
        .and_then(|caps| caps.name("token"))
        .map(|token| html_escape::decode_html_entities(token.as_str()).into_owned())
}

/// Build origin header value from URL (`scheme://host[:port]`).
pub fn origin_from_url(url: &Url) -> String {
    let mut origin = format!("{}://{}", url.scheme(), url.host_str().unwrap_or(""));
    if let Some(port) = url.port() {
        origin.push(':');
        origin.push_str(&port.to_string());
    }
    origin
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOGIN_PAGE: &str = r#"
        <html><body>
            <form id="search" action="/search"><input name="q" type="text"></form>
            <form method="post" action="/Account/Login?ReturnUrl=%2FTenant">
                <input type="hidden" name="__RequestVerificationToken" value="csrf-123">
                <input type="hidden" name="__VIEWSTATE" value="vs">
                <input type="email" name="Email">
                <input type="password" name="Secret">
                <input type="submit" name="Login" value="Sign in">
            </form>
        </body></html>
    "#;

    fn token_hints() -> LoginFormHints {
        LoginFormHints {
            anti_forgery_field: Some("__RequestVerificationToken".into()),
            ..LoginFormHints::default()
        }
    }

    #[test]
    fn extracts_login_form_fields() {
        let blueprint = parse_login_form(LOGIN_PAGE, &token_hints()).unwrap();

        assert_eq!(blueprint.action, "/Account/Login?ReturnUrl=%2FTenant");
        assert_eq!(blueprint.username_field.as_deref(), Some("Email"));
        assert_eq!(blueprint.password_field.as_deref(), Some("Secret"));
        assert_eq!(
            blueprint.hidden_value("__RequestVerificationToken"),
            Some("csrf-123")
        );
        assert_eq!(blueprint.hidden_value("__VIEWSTATE"), Some("vs"));
    }

    #[test]
    fn missing_token_is_a_form_error() {
        let html = r#"<form action="/login"><input name="u"><input type="password" name="p"></form>"#;
        let err = parse_login_form(html, &token_hints()).unwrap_err();
        assert_eq!(
            err,
            LoginFormError::MissingToken("__RequestVerificationToken".into())
        );
    }

    #[test]
    fn token_outside_form_is_accepted() {
        let html = r#"
            <input type="hidden" name="__RequestVerificationToken" value="outside">
            <form action="/login"><input name="u"><input type="password" name="p"></form>
        "#;
        let blueprint = parse_login_form(html, &token_hints()).unwrap();
        assert_eq!(
            blueprint.hidden_value("__RequestVerificationToken"),
            Some("outside")
        );
    }

    #[test]
    fn page_without_password_input_has_no_form() {
        let html = r#"<form action="/search"><input name="q"></form>"#;
        let err = parse_login_form(html, &LoginFormHints::default()).unwrap_err();
        assert_eq!(err, LoginFormError::FormNotFound);
    }

    #[test]
    fn builds_submission_against_page_url() {
        let page_url = Url::parse("https://portal.test/Account/Login").unwrap();
        let blueprint = parse_login_form(LOGIN_PAGE, &token_hints()).unwrap();
        let submission = blueprint
            .to_submission(&page_url, &token_hints(), "alice", "secret")
            .unwrap();

        assert_eq!(
            submission.url.as_str(),
            "https://portal.test/Account/Login?ReturnUrl=%2FTenant"
        );
        assert_eq!(submission.form_fields["Email"], "alice");
        assert_eq!(submission.form_fields["Secret"], "secret");
        assert_eq!(submission.form_fields["__RequestVerificationToken"], "csrf-123");
        assert_eq!(submission.headers["Origin"], "https://portal.test");
    }

    #[test]
    fn hints_override_detected_inputs() {
        let page_url = Url::parse("https://portal.test/login").unwrap();
        let hints = LoginFormHints {
            username_field: Some("UserName".into()),
            password_field: Some("Password".into()),
            anti_forgery_field: None,
        };
        let blueprint = parse_login_form(LOGIN_PAGE, &hints).unwrap();
        let submission = blueprint
            .to_submission(&page_url, &hints, "bob", "pw")
            .unwrap();

        assert_eq!(submission.form_fields["UserName"], "bob");
        assert_eq!(submission.form_fields["Password"], "pw");
    }

    #[test]
    fn reads_validation_message() {
        let html = r#"<div class="validation-summary-errors"><ul><li>Invalid login attempt.</li></ul></div>"#;
        assert_eq!(
            validation_message(html).as_deref(),
            Some("Invalid login attempt.")
        );
    }

    #[test]
    fn locates_embedded_access_token() {
        let html = r#"<script>window.session = { "accessToken": "eyJhbGciOi.abc.def" };</script>"#;
        assert_eq!(
            locate_access_token(html).as_deref(),
            Some("eyJhbGciOi.abc.def")
        );
        assert!(locate_access_token("<p>no token</p>").is_none());
    }

    #[test]
    fn origin_keeps_explicit_port() {
        let url = Url::parse("http://127.0.0.1:8080/login").unwrap();
        assert_eq!(origin_from_url(&url), "http://127.0.0.1:8080");
    }
}
