//! Form-postback adapter for the public licensee search.
//!
//! The search page is an ASP.NET WebForms application: every request posts
//! the full form state (view state, event validation) returned by the
//! previous response. A session therefore walks
//! landing page → "search by person" form → results → next page …, and the
//! adapter keeps that state between calls. Error and rate-limit pages reset
//! the session and surface as transient [`HarvestError::Blocked`] errors.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use scraper::{ElementRef, Html, Selector};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use url::Url;

use leadharvest_shared::{FetchConfig, HarvestError, RawRecord, RecordStatus, Result};

use crate::contact;
use crate::http::{build_client, network_error, read_body};
use crate::source::{DetailContact, DetailSource, DirectorySource, Page};

/// Event target of the report's drill-through action.
const DRILL_TARGET: &str = "ReportViewer1$ctl13$ReportControl$ctl00";

/// Text box holding the last-name query.
const LAST_NAME_FIELD: &str = "TextBox2";

/// Lower-cased markers of error, rate-limit and challenge pages.
const ERROR_INDICATORS: &[&str] = &[
    "runtime error",
    "server error in '/' application",
    "invalid postback",
    "event validation",
    "too many requests",
    "captcha",
    "blocked",
];

/// Result rows need at least this many cells.
const MIN_ROW_CELLS: usize = 10;

static DRILL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"InvokeReportAction\('Drillthrough','([^']+)'").expect("valid regex")
});

static POSTBACK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"__doPostBack\('([^']*)','([^']*)'\)").expect("valid regex")
});

static INPUT_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("input[name]").expect("valid selector"));
static SELECT_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("select[name]").expect("valid selector"));
static OPTION_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("option").expect("valid selector"));
static DIV_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("div").expect("valid selector"));
static LINK_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a").expect("valid selector"));
static NEXT_SEL: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(r#"input[title="Next Page"], a[title="Next Page"]"#).expect("valid selector")
});

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// How to request the page after the current one.
#[derive(Debug, Clone, PartialEq, Eq)]
enum NextControl {
    /// `<input type="image">` button, posted as `name.x` / `name.y`.
    Image(String),
    /// `__doPostBack(target, argument)` link.
    PostBack { target: String, argument: String },
}

/// Where the live session currently is.
#[derive(Debug, Clone)]
struct Position {
    key: String,
    page: u32,
    next: Option<NextControl>,
}

#[derive(Debug, Default)]
struct Session {
    form: BTreeMap<String, String>,
    initialized: bool,
    position: Option<Position>,
}

/// A parsed results page.
#[derive(Debug, Default)]
struct ResultsPage {
    records: Vec<RawRecord>,
    next: Option<NextControl>,
}

// ---------------------------------------------------------------------------
// FormDirectory
// ---------------------------------------------------------------------------

/// Directory adapter speaking the search page's postback protocol.
pub struct FormDirectory {
    client: Client,
    base_url: Url,
    session: Mutex<Session>,
}

impl FormDirectory {
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url).map_err(|e| {
            HarvestError::config(format!("invalid directory URL '{}': {e}", config.base_url))
        })?;
        let client = build_client(&config.user_agent, config.timeout(), true)?;
        Ok(Self {
            client,
            base_url,
            session: Mutex::new(Session::default()),
        })
    }

    async fn get(&self) -> Result<String> {
        let url = self.base_url.as_str();
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| network_error(url, e))?;
        read_body(url, resp).await
    }

    /// POST a form and reject error pages.
    async fn post(&self, form: &BTreeMap<String, String>) -> Result<String> {
        let url = self.base_url.as_str();
        let resp = self
            .client
            .post(url)
            .form(form)
            .send()
            .await
            .map_err(|e| network_error(url, e))?;
        let body = read_body(url, resp).await?;
        if let Some(indicator) = error_indicator(&body) {
            return Err(HarvestError::Blocked(format!(
                "upstream returned an error page ({indicator})"
            )));
        }
        Ok(body)
    }

    /// Landing page, then switch to the person search form.
    async fn initialize(&self, session: &mut Session) -> Result<()> {
        let landing = self.get().await?;
        let mut form = extract_inputs(&Html::parse_document(&landing));
        strip_buttons(&mut form);
        form.insert("Button1".into(), "Search by Person".into());

        let body = self.post(&form).await?;
        session.form = extract_inputs(&Html::parse_document(&body));
        session.initialized = true;
        session.position = None;
        debug!("directory session initialized");
        Ok(())
    }

    async fn search(&self, session: &mut Session, key: &str) -> Result<ResultsPage> {
        let mut form = session.form.clone();
        strip_buttons(&mut form);
        form.insert(LAST_NAME_FIELD.into(), key.into());
        form.insert("Button3".into(), "Search".into());

        let body = self.post(&form).await?;
        let page = Self::absorb(session, &body);
        session.position = Some(Position {
            key: key.to_string(),
            page: 1,
            next: page.next.clone(),
        });
        Ok(page)
    }

    /// Advance the live session by one page.
    async fn advance(&self, session: &mut Session, control: &NextControl) -> Result<ResultsPage> {
        let mut form = session.form.clone();
        strip_buttons(&mut form);
        match control {
            NextControl::Image(name) => {
                form.insert(format!("{name}.x"), "5".into());
                form.insert(format!("{name}.y"), "5".into());
            }
            NextControl::PostBack { target, argument } => {
                form.insert("__EVENTTARGET".into(), target.clone());
                form.insert("__EVENTARGUMENT".into(), argument.clone());
            }
        }

        let body = self.post(&form).await?;
        let page = Self::absorb(session, &body);
        if let Some(pos) = session.position.as_mut() {
            pos.page += 1;
            pos.next = page.next.clone();
        }
        Ok(page)
    }

    /// Keep the response's form state and parse its grid.
    fn absorb(session: &mut Session, body: &str) -> ResultsPage {
        let doc = Html::parse_document(body);
        session.form = extract_inputs(&doc);
        ResultsPage {
            records: parse_results(&doc),
            next: find_next_control(&doc),
        }
    }

    async fn fetch_locked(&self, session: &mut Session, key: &str, page: u32) -> Result<Page> {
        if !session.initialized {
            self.initialize(session).await?;
        }

        let follow = match &session.position {
            Some(pos) if pos.key == key && pos.page + 1 == page => pos.next.clone(),
            _ => None,
        };

        let results = if let Some(control) = follow {
            self.advance(session, &control).await?
        } else {
            let mut results = self.search(session, key).await?;
            if page > 1 {
                debug!(key, page, "re-seeking to page");
            }
            while session.position.as_ref().is_some_and(|p| p.page < page) {
                let Some(control) = results.next.clone() else {
                    warn!(key, page, "requested page is past the end of the results");
                    return Ok(Page::default());
                };
                results = self.advance(session, &control).await?;
            }
            results
        };

        let next_cursor = results.next.as_ref().map(|_| (page + 1).to_string());
        Ok(Page {
            records: results.records,
            next_cursor,
        })
    }
}

#[async_trait]
impl DirectorySource for FormDirectory {
    fn name(&self) -> &str {
        "form-directory"
    }

    #[instrument(skip_all, fields(key = %key, cursor = ?cursor))]
    async fn fetch_page(&self, key: &str, cursor: Option<&str>) -> Result<Page> {
        let page = parse_cursor(cursor)?;
        let mut session = self.session.lock().await;
        match self.fetch_locked(&mut session, key, page).await {
            Ok(result) => {
                info!(
                    records = result.records.len(),
                    has_next = result.next_cursor.is_some(),
                    "page fetched"
                );
                Ok(result)
            }
            Err(err) => {
                if err.is_transient() {
                    *session = Session::default();
                }
                Err(err)
            }
        }
    }
}

#[async_trait]
impl DetailSource for FormDirectory {
    async fn fetch_detail(&self, external_id: &str) -> Result<Option<DetailContact>> {
        let mut session = self.session.lock().await;
        if !session.initialized {
            if let Err(err) = self.initialize(&mut session).await {
                *session = Session::default();
                return Err(err);
            }
        }

        let mut form = session.form.clone();
        strip_buttons(&mut form);
        form.insert("__EVENTTARGET".into(), DRILL_TARGET.into());
        form.insert("__EVENTARGUMENT".into(), format!("Drillthrough${external_id}"));

        let body = match self.post(&form).await {
            Ok(body) => body,
            Err(err) => {
                if err.is_transient() {
                    *session = Session::default();
                }
                return Err(err);
            }
        };
        drop(session);

        let contact = parse_detail(&body);
        debug!(
            external_id,
            has_email = contact.email.is_some(),
            has_phone = contact.phone.is_some(),
            "detail fetched"
        );
        if contact.email.is_none() && contact.phone.is_none() {
            return Ok(None);
        }
        Ok(Some(contact))
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

fn parse_cursor(cursor: Option<&str>) -> Result<u32> {
    match cursor {
        None => Ok(1),
        Some(c) => c
            .parse::<u32>()
            .ok()
            .filter(|p| *p >= 1)
            .ok_or_else(|| HarvestError::validation(format!("invalid page cursor '{c}'"))),
    }
}

fn error_indicator(body: &str) -> Option<&'static str> {
    let lower = body.to_lowercase();
    ERROR_INDICATORS.iter().copied().find(|ind| lower.contains(ind))
}

fn strip_buttons(form: &mut BTreeMap<String, String>) {
    for button in ["Button1", "Button2", "Button3"] {
        form.remove(button);
    }
}

/// Collect the form fields a browser would submit.
fn extract_inputs(doc: &Html) -> BTreeMap<String, String> {
    let mut form = BTreeMap::new();

    for input in doc.select(&INPUT_SEL) {
        let el = input.value();
        let Some(name) = el.attr("name") else {
            continue;
        };
        let kind = el.attr("type").unwrap_or("text").to_ascii_lowercase();
        let value = el.attr("value").unwrap_or_default();
        match kind.as_str() {
            "hidden" | "text" | "password" | "search" => {
                form.insert(name.to_string(), value.to_string());
            }
            "checkbox" | "radio" if el.attr("checked").is_some() => {
                form.insert(name.to_string(), value.to_string());
            }
            _ => {}
        }
    }

    for select in doc.select(&SELECT_SEL) {
        let Some(name) = select.value().attr("name") else {
            continue;
        };
        let options: Vec<ElementRef<'_>> = select.select(&OPTION_SEL).collect();
        let chosen = options
            .iter()
            .find(|o| o.value().attr("selected").is_some())
            .or(options.first());
        if let Some(option) = chosen {
            let value = option.value().attr("value").unwrap_or_default();
            form.insert(name.to_string(), value.to_string());
        }
    }

    form
}

/// Text of an element, whitespace-joined and trimmed.
fn cell_text(el: &ElementRef<'_>) -> String {
    el.text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn own_text(el: &ElementRef<'_>) -> String {
    el.children()
        .filter_map(|c| c.value().as_text().map(|t| t.to_string()))
        .collect()
}

fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut prev_alpha = false;
    for ch in s.chars() {
        if prev_alpha {
            out.extend(ch.to_lowercase());
        } else {
            out.extend(ch.to_uppercase());
        }
        prev_alpha = ch.is_alphabetic();
    }
    out
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() { None } else { Some(s) }
}

/// Parse the licence grid that follows the "Licence History" header row.
fn parse_results(doc: &Html) -> Vec<RawRecord> {
    let Some(header_div) = doc
        .select(&DIV_SEL)
        .find(|d| own_text(d).contains("Licence History"))
    else {
        return Vec::new();
    };
    let Some(header_row) = header_div
        .ancestors()
        .filter_map(ElementRef::wrap)
        .find(|e| e.value().name() == "tr")
    else {
        return Vec::new();
    };

    let mut records = Vec::new();
    for row in header_row
        .next_siblings()
        .filter_map(ElementRef::wrap)
        .filter(|e| e.value().name() == "tr")
    {
        let cells: Vec<ElementRef<'_>> = row
            .children()
            .filter_map(ElementRef::wrap)
            .filter(|e| e.value().name() == "td")
            .collect();
        if cells.len() < MIN_ROW_CELLS {
            continue;
        }
        let text = |idx: usize| cells.get(idx).map(cell_text).unwrap_or_default();

        let status_text = text(0);
        let Some(status) = RecordStatus::from_directory(&status_text) else {
            continue;
        };

        let drill_id = cells[1]
            .select(&LINK_SEL)
            .filter_map(|a| a.value().attr("onclick"))
            .find_map(|onclick| DRILL_RE.captures(onclick).map(|c| c[1].to_string()));
        let Some(external_id) = drill_id else {
            debug!(status = %status_text, last = %text(4), "row without drill-through id, skipping");
            continue;
        };

        records.push(RawRecord {
            external_id,
            first_name: text(2),
            middle_name: text(3),
            last_name: text(4),
            aka: non_empty(text(5)),
            organization: text(6),
            city: title_case(&text(7)),
            sector: non_empty(text(10)),
            status,
        });
    }
    records
}

/// An enabled "Next Page" control, if the report shows one.
fn find_next_control(doc: &Html) -> Option<NextControl> {
    let el = doc.select(&NEXT_SEL).next()?;
    let attrs = el.value();
    if attrs.attr("disabled").is_some() {
        return None;
    }
    match attrs.name() {
        "input" => attrs.attr("name").map(|n| NextControl::Image(n.to_string())),
        _ => {
            let script = attrs.attr("href").or_else(|| attrs.attr("onclick"))?;
            POSTBACK_RE.captures(script).map(|c| NextControl::PostBack {
                target: c[1].to_string(),
                argument: c[2].to_string(),
            })
        }
    }
}

/// Email from the raw markup (mailto first), phone from visible text.
fn parse_detail(body: &str) -> DetailContact {
    let doc = Html::parse_document(body);
    let visible = cell_text(&doc.root_element());
    DetailContact {
        email: contact::extract_email(body),
        phone: contact::extract_phone(&visible),
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{body_string_contains, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    macro_rules! fixture {
        ($name:literal) => {
            include_str!(concat!(
                env!("CARGO_MANIFEST_DIR"),
                "/../../../fixtures/html/",
                $name
            ))
        };
    }

    const LANDING: &str = fixture!("directory_landing.html");
    const PERSON_FORM: &str = fixture!("directory_person_form.html");
    const RESULTS_1: &str = fixture!("directory_results_page1.html");
    const RESULTS_2: &str = fixture!("directory_results_page2.html");
    const DETAIL: &str = fixture!("directory_detail.html");
    const ERROR_PAGE: &str = fixture!("directory_error.html");

    fn html(body: &str) -> ResponseTemplate {
        ResponseTemplate::new(200)
            .insert_header("content-type", "text/html; charset=utf-8")
            .set_body_string(body)
    }

    async fn mount_session(server: &MockServer) {
        Mock::given(method("GET"))
            .respond_with(html(LANDING))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(body_string_contains("Button1=Search+by+Person"))
            .respond_with(html(PERSON_FORM))
            .mount(server)
            .await;
    }

    fn directory(server: &MockServer) -> FormDirectory {
        let config = FetchConfig {
            base_url: format!("{}/publicsearch.aspx", server.uri()),
            ..FetchConfig::default()
        };
        FormDirectory::new(&config).unwrap()
    }

    #[test]
    fn extracts_submittable_inputs() {
        let form = extract_inputs(&Html::parse_document(LANDING));
        assert_eq!(form.get("__VIEWSTATE").map(String::as_str), Some("vs-landing"));
        assert_eq!(form.get("ddlIndustry").map(String::as_str), Some("re"));
        assert_eq!(form.get("ddlSort").map(String::as_str), Some("last"));
        assert_eq!(form.get("chkActiveOnly").map(String::as_str), Some("on"));
        assert!(!form.contains_key("chkHistoric"));
        assert!(!form.contains_key("Button1"));
    }

    #[test]
    fn parses_result_grid() {
        let records = parse_results(&Html::parse_document(RESULTS_1));
        let ids: Vec<&str> = records.iter().map(|r| r.external_id.as_str()).collect();
        assert_eq!(ids, vec!["X1001", "X1002"]);

        let jane = &records[0];
        assert_eq!(jane.first_name, "Jane");
        assert_eq!(jane.middle_name, "Q");
        assert_eq!(jane.last_name, "Smith");
        assert_eq!(jane.aka, None);
        assert_eq!(jane.organization, "RE/MAX River City");
        assert_eq!(jane.city, "Calgary");
        assert_eq!(jane.sector.as_deref(), Some("Residential"));
        assert_eq!(jane.status, RecordStatus::Licensed);

        let john = &records[1];
        assert_eq!(john.aka.as_deref(), Some("Jack"));
        assert_eq!(john.city, "Red Deer");
        assert_eq!(john.status, RecordStatus::Cancelled);
    }

    #[test]
    fn grid_without_header_is_empty() {
        let records = parse_results(&Html::parse_document(PERSON_FORM));
        assert!(records.is_empty());
    }

    #[test]
    fn next_control_detection() {
        let next = find_next_control(&Html::parse_document(RESULTS_1));
        assert_eq!(
            next,
            Some(NextControl::Image(
                "ReportViewer1$ctl05$ctl00$Next$ctl00$ctl00".into()
            ))
        );
        assert_eq!(find_next_control(&Html::parse_document(RESULTS_2)), None);

        let link = r#"<a title="Next Page" href="javascript:__doPostBack('Grid$Pager','Page$2')">Next</a>"#;
        assert_eq!(
            find_next_control(&Html::parse_document(link)),
            Some(NextControl::PostBack {
                target: "Grid$Pager".into(),
                argument: "Page$2".into(),
            })
        );
    }

    #[test]
    fn detail_contact_extraction() {
        let contact = parse_detail(DETAIL);
        assert_eq!(contact.email.as_deref(), Some("jane.smith@remax.ca"));
        assert_eq!(contact.phone.as_deref(), Some("(403) 555-0142"));
    }

    #[test]
    fn error_pages_are_detected() {
        assert!(error_indicator(ERROR_PAGE).is_some());
        assert!(error_indicator(RESULTS_1).is_none());
    }

    #[test]
    fn title_case_matches_directory_city_style() {
        assert_eq!(title_case("ST. ALBERT"), "St. Albert");
        assert_eq!(title_case("red deer"), "Red Deer");
        assert_eq!(title_case("fort mcmurray"), "Fort Mcmurray");
    }

    #[test]
    fn cursor_parsing() {
        assert_eq!(parse_cursor(None).unwrap(), 1);
        assert_eq!(parse_cursor(Some("3")).unwrap(), 3);
        assert!(parse_cursor(Some("0")).is_err());
        assert!(parse_cursor(Some("abc")).is_err());
    }

    #[tokio::test]
    async fn fetches_and_follows_pages() {
        let server = MockServer::start().await;
        mount_session(&server).await;
        Mock::given(method("POST"))
            .and(body_string_contains("Button3=Search"))
            .and(body_string_contains("TextBox2=Smi"))
            .respond_with(html(RESULTS_1))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_string_contains("Next%24ctl00%24ctl00.x=5"))
            .respond_with(html(RESULTS_2))
            .expect(1)
            .mount(&server)
            .await;

        let dir = directory(&server);
        let first = dir.fetch_page("Smi", None).await.unwrap();
        assert_eq!(first.records.len(), 2);
        assert_eq!(first.next_cursor.as_deref(), Some("2"));

        let second = dir.fetch_page("Smi", Some("2")).await.unwrap();
        assert_eq!(second.records.len(), 1);
        assert_eq!(second.records[0].status, RecordStatus::Suspended);
        assert_eq!(second.records[0].city, "St. Albert");
        assert_eq!(second.next_cursor, None);
    }

    #[tokio::test]
    async fn reseeks_when_resuming_mid_key() {
        let server = MockServer::start().await;
        mount_session(&server).await;
        Mock::given(method("POST"))
            .and(body_string_contains("Button3=Search"))
            .respond_with(html(RESULTS_1))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_string_contains("Next%24ctl00%24ctl00.x=5"))
            .respond_with(html(RESULTS_2))
            .expect(1)
            .mount(&server)
            .await;

        let dir = directory(&server);
        let page = dir.fetch_page("Smi", Some("2")).await.unwrap();
        assert_eq!(page.records[0].external_id, "X1004");
    }

    #[tokio::test]
    async fn error_page_is_transient_and_resets_session() {
        let server = MockServer::start().await;
        mount_session(&server).await;
        Mock::given(method("POST"))
            .and(body_string_contains("Button3=Search"))
            .respond_with(html(ERROR_PAGE))
            .mount(&server)
            .await;

        let dir = directory(&server);
        let err = dir.fetch_page("Smi", None).await.unwrap_err();
        assert!(matches!(err, HarvestError::Blocked(_)));
        assert!(err.is_transient());
        assert!(!dir.session.lock().await.initialized);
    }

    #[tokio::test]
    async fn drill_through_returns_contact() {
        let server = MockServer::start().await;
        mount_session(&server).await;
        Mock::given(method("POST"))
            .and(body_string_contains("__EVENTARGUMENT=Drillthrough%24X1001"))
            .respond_with(html(DETAIL))
            .expect(1)
            .mount(&server)
            .await;

        let dir = directory(&server);
        let contact = dir.fetch_detail("X1001").await.unwrap().unwrap();
        assert_eq!(contact.email.as_deref(), Some("jane.smith@remax.ca"));
        assert_eq!(contact.phone.as_deref(), Some("(403) 555-0142"));
    }
}
