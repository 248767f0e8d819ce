//! Queryable HTML documents handed to page accessors.
//!
//! Wraps the parsed tree behind a small selector API so callers never depend
//! on the parser's own types. The document keeps the page source and builds
//! the tree per query, so pages can be held across `.await` points on a
//! multi-threaded runtime.

use std::collections::BTreeMap;
use std::sync::Arc;

use scraper::{ElementRef, Html, Selector};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DocumentError {
    #[error("invalid CSS selector `{selector}`: {reason}")]
    InvalidSelector { selector: String, reason: String },
}

/// Owned copy of one matched element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementSnapshot {
    pub tag: String,
    /// Whitespace-normalised text content.
    pub text: String,
    pub inner_html: String,
    pub attributes: BTreeMap<String, String>,
}

impl ElementSnapshot {
    fn from_element(element: ElementRef<'_>) -> Self {
        Self {
            tag: element.value().name().to_string(),
            text: normalized_text(element),
            inner_html: element.inner_html(),
            attributes: element
                .value()
                .attrs()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
        }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }
}

/// Parsed HTML page.
#[derive(Debug, Clone)]
pub struct ParsedDocument {
    source: Arc<str>,
}

impl ParsedDocument {
    pub fn parse(body: &str) -> Self {
        Self {
            source: Arc::from(body),
        }
    }

    fn tree(&self) -> Html {
        Html::parse_document(&self.source)
    }

    /// Every element matching `css`, in document order.
    pub fn select(&self, css: &str) -> Result<Vec<ElementSnapshot>, DocumentError> {
        let selector = compile(css)?;
        let tree = self.tree();
        Ok(tree
            .select(&selector)
            .map(ElementSnapshot::from_element)
            .collect())
    }

    pub fn select_first(&self, css: &str) -> Result<Option<ElementSnapshot>, DocumentError> {
        let selector = compile(css)?;
        let tree = self.tree();
        Ok(tree
            .select(&selector)
            .next()
            .map(ElementSnapshot::from_element))
    }

    /// Text of the first match; `None` when nothing matches.
    pub fn text_of(&self, css: &str) -> Result<Option<String>, DocumentError> {
        let selector = compile(css)?;
        let tree = self.tree();
        Ok(tree.select(&selector).next().map(normalized_text))
    }

    /// Attribute of the first match carrying it.
    pub fn attr_of(&self, css: &str, attr: &str) -> Result<Option<String>, DocumentError> {
        let selector = compile(css)?;
        let tree = self.tree();
        Ok(tree
            .select(&selector)
            .find_map(|element| element.value().attr(attr))
            .map(str::to_string))
    }

    pub fn title(&self) -> Option<String> {
        self.text_of("title").ok().flatten().filter(|title| !title.is_empty())
    }

    /// Page source as received.
    pub fn html(&self) -> &str {
        &self.source
    }
}

fn compile(css: &str) -> Result<Selector, DocumentError> {
    Selector::parse(css).map_err(|err| DocumentError::InvalidSelector {
        selector: css.to_string(),
        reason: err.to_string(),
    })
}

fn normalized_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const DELIVERIES: &str = r#"
        <html>
          <head><title> Deliveries </title></head>
          <body>
            <table id="deliveries">
              <tr class="row" data-id="17"><td>Amazon</td><td>  Front
                desk</td></tr>
              <tr class="row" data-id="18"><td>UPS</td><td>Mailroom</td></tr>
            </table>
            <a href="/V2/Tenant/Deliveries/History.aspx">History</a>
          </body>
        </html>
    "#;

    #[test]
    fn selects_rows_in_document_order() {
        let document = ParsedDocument::parse(DELIVERIES);
        let rows = document.select("#deliveries tr.row").unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].tag, "tr");
        assert_eq!(rows[0].text, "Amazon Front desk");
        assert_eq!(rows[1].attr("data-id"), Some("18"));
        assert!(rows[1].inner_html.contains("<td>UPS</td>"));
    }

    #[test]
    fn reads_text_attributes_and_title() {
        let document = ParsedDocument::parse(DELIVERIES);

        assert_eq!(document.title().as_deref(), Some("Deliveries"));
        assert_eq!(
            document.attr_of("a", "href").unwrap().as_deref(),
            Some("/V2/Tenant/Deliveries/History.aspx")
        );
        assert_eq!(document.text_of("td").unwrap().as_deref(), Some("Amazon"));
        assert!(document.select_first("form").unwrap().is_none());
    }

    #[test]
    fn documents_cross_threads() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ParsedDocument>();

        let document = ParsedDocument::parse(DELIVERIES);
        let title = std::thread::spawn(move || document.title())
            .join()
            .unwrap();
        assert_eq!(title.as_deref(), Some("Deliveries"));
    }

    #[test]
    fn keeps_the_page_source() {
        let document = ParsedDocument::parse(DELIVERIES);
        assert_eq!(document.html(), DELIVERIES);
    }

    #[test]
    fn invalid_selector_is_reported() {
        let document = ParsedDocument::parse(DELIVERIES);
        let err = document.select("tr[").unwrap_err();
        assert!(matches!(err, DocumentError::InvalidSelector { .. }));
    }
}
