//! Listing-card extraction and pagination over rendered search pages.

use std::time::Duration;

use chrono::Utc;
use rijh_core::{
    classify_experience, classify_work_type, clean_location, is_recent, JobRecord, POSTED_RECENTLY,
};
use rijh_fetch::PageFetcher;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "rijh-extract";

const CARD_SELECTOR: &str = "div.base-card";
const POSTED_DATE_SELECTOR: &str = "time.job-search-card__listdate";
const TITLE_SELECTOR: &str = "h3.base-search-card__title";
const COMPANY_SELECTOR: &str = "h4.base-search-card__subtitle";
const LOCATION_SELECTOR: &str = "span.job-search-card__location";
const LINK_SELECTOR: &str = "a.base-card__full-link";
const DESCRIPTION_SELECTOR: &str = "div.show-more-less-html__markup";

/// Capability view of one markup element. Only the operations the extractor
/// needs, so the backing HTML library can be swapped without touching it.
pub trait DocumentNode {
    fn text(&self) -> String;
    fn attribute(&self, name: &str) -> Option<String>;
    fn find_one(&self, selector: &str) -> Option<Box<dyn DocumentNode + '_>>;
}

/// Capability view of one parsed page.
pub trait DocumentParser {
    fn find_all(&self, selector: &str) -> Vec<Box<dyn DocumentNode + '_>>;
    fn find_one(&self, selector: &str) -> Option<Box<dyn DocumentNode + '_>>;
}

/// `scraper`-backed implementation of the document capabilities.
pub struct HtmlDocument {
    html: Html,
}

impl HtmlDocument {
    pub fn parse(text: &str) -> Self {
        Self {
            html: Html::parse_document(text),
        }
    }
}

// The selectors used here are fixed constants; an invalid one simply
// matches nothing.
fn compile(selector: &str) -> Option<Selector> {
    Selector::parse(selector).ok()
}

struct HtmlNode<'a> {
    element: ElementRef<'a>,
}

impl DocumentParser for HtmlDocument {
    fn find_all(&self, selector: &str) -> Vec<Box<dyn DocumentNode + '_>> {
        let Some(sel) = compile(selector) else {
            return Vec::new();
        };
        self.html
            .select(&sel)
            .map(|element| Box::new(HtmlNode { element }) as Box<dyn DocumentNode + '_>)
            .collect()
    }

    fn find_one(&self, selector: &str) -> Option<Box<dyn DocumentNode + '_>> {
        let sel = compile(selector)?;
        self.html
            .select(&sel)
            .next()
            .map(|element| Box::new(HtmlNode { element }) as Box<dyn DocumentNode + '_>)
    }
}

impl DocumentNode for HtmlNode<'_> {
    fn text(&self) -> String {
        self.element.text().collect::<String>().trim().to_string()
    }

    fn attribute(&self, name: &str) -> Option<String> {
        self.element.value().attr(name).map(ToString::to_string)
    }

    fn find_one(&self, selector: &str) -> Option<Box<dyn DocumentNode + '_>> {
        let sel = compile(selector)?;
        self.element
            .select(&sel)
            .next()
            .map(|element| Box::new(HtmlNode { element }) as Box<dyn DocumentNode + '_>)
    }
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("listing card missing required element: {0}")]
    MissingField(&'static str),
}

/// Card fields lifted off the results page, before the detail fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardDraft {
    pub title: String,
    pub company: String,
    pub raw_location: String,
    pub url: String,
    pub posted_date_text: Option<String>,
}

/// Outcome of scanning one results page, detail fetches still pending.
#[derive(Debug, Default)]
pub struct CardScan {
    pub drafts: Vec<CardDraft>,
    pub cards_seen: usize,
    pub recent_found: bool,
}

fn required_text(
    card: &dyn DocumentNode,
    selector: &str,
    field: &'static str,
) -> Result<String, ExtractError> {
    card.find_one(selector)
        .map(|node| node.text())
        .filter(|text| !text.is_empty())
        .ok_or(ExtractError::MissingField(field))
}

fn parse_card(
    card: &dyn DocumentNode,
    posted_date_text: Option<String>,
) -> Result<CardDraft, ExtractError> {
    let title = required_text(card, TITLE_SELECTOR, "title")?;
    let company = required_text(card, COMPANY_SELECTOR, "company")?;
    let raw_location = required_text(card, LOCATION_SELECTOR, "location")?;
    let url = card
        .find_one(LINK_SELECTOR)
        .and_then(|node| node.attribute("href"))
        .ok_or(ExtractError::MissingField("detail link"))?;
    Ok(CardDraft {
        title,
        company,
        raw_location,
        url,
        posted_date_text,
    })
}

/// Scan every listing card on a results page.
///
/// A dated card outside the freshness window is dropped without counting as
/// recent. A card inside the window marks the page recent even when its
/// remaining fields fail to parse; malformed cards are logged and skipped,
/// never fatal to the page.
pub fn scan_cards(doc: &dyn DocumentParser) -> CardScan {
    let cards = doc.find_all(CARD_SELECTOR);
    let mut scan = CardScan {
        cards_seen: cards.len(),
        ..CardScan::default()
    };

    for card in &cards {
        let posted_date_text = card.find_one(POSTED_DATE_SELECTOR).map(|node| node.text());
        if let Some(text) = posted_date_text.as_deref() {
            if !is_recent(text) {
                continue;
            }
        }
        scan.recent_found = true;

        match parse_card(card.as_ref(), posted_date_text) {
            Ok(draft) => scan.drafts.push(draft),
            Err(err) => warn!(%err, "skipping malformed listing card"),
        }
    }
    scan
}

/// One results page, fully extracted.
#[derive(Debug)]
pub struct PageExtraction {
    pub records: Vec<JobRecord>,
    /// Total cards on the page. Zero means the term is exhausted.
    pub cards_seen: usize,
    /// Whether any card passed the recency filter.
    pub recent_found: bool,
}

/// Extract the recent listings from one rendered results page, fetching each
/// surviving card's detail page for its description. A failed detail fetch
/// skips that card only.
pub async fn extract_page(
    page_html: &str,
    category: &str,
    fetcher: &dyn PageFetcher,
) -> PageExtraction {
    let scan = {
        let doc = HtmlDocument::parse(page_html);
        scan_cards(&doc)
    };

    let mut records = Vec::with_capacity(scan.drafts.len());
    for draft in scan.drafts {
        let detail_html = match fetcher.fetch_page(&draft.url).await {
            Ok(body) => body,
            Err(err) => {
                warn!(url = %draft.url, %err, "detail page fetch failed; skipping card");
                continue;
            }
        };
        let description = {
            let doc = HtmlDocument::parse(&detail_html);
            doc.find_one(DESCRIPTION_SELECTOR)
                .map(|node| node.text())
                .unwrap_or_default()
        };

        records.push(JobRecord {
            title: draft.title,
            company: draft.company,
            location: clean_location(&draft.raw_location),
            raw_location: draft.raw_location,
            experience_level: classify_experience(&description),
            work_type: classify_work_type(&description),
            category: category.to_string(),
            posted_date_text: draft
                .posted_date_text
                .unwrap_or_else(|| POSTED_RECENTLY.to_string()),
            url: draft.url,
            scraped_at: Utc::now(),
        });
    }

    PageExtraction {
        records,
        cards_seen: scan.cards_seen,
        recent_found: scan.recent_found,
    }
}

#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub base_url: String,
    pub location: String,
    /// Upstream "posted within" filter flag; r86400 = last 24 hours.
    pub time_filter: String,
    pub page_size: usize,
    /// Small fixed cap; the hosting environment bounds total execution time.
    pub max_pages_per_term: usize,
    pub page_delay: Duration,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.linkedin.com/jobs/search/".to_string(),
            location: "United Kingdom".to_string(),
            time_filter: "r86400".to_string(),
            page_size: 25,
            max_pages_per_term: 1,
            page_delay: Duration::from_secs(1),
        }
    }
}

pub fn search_page_url(config: &SearchConfig, term: &str, page: usize) -> String {
    format!(
        "{}?keywords={}&location={}&start={}&f_TPR={}",
        config.base_url,
        urlencoding::encode(term),
        urlencoding::encode(&config.location),
        page * config.page_size,
        config.time_filter,
    )
}

/// Drive extraction across result pages for one search term.
///
/// Stops on a failed page fetch, on a page with no cards at all, or after two
/// consecutive pages with nothing recent (results are date-ordered, so later
/// pages are older still).
pub async fn harvest_term(
    config: &SearchConfig,
    fetcher: &dyn PageFetcher,
    term: &str,
) -> Vec<JobRecord> {
    let mut records = Vec::new();
    let mut page = 0;
    let mut stale_streak = 0;

    while page < config.max_pages_per_term {
        let url = search_page_url(config, term, page);
        let body = match fetcher.fetch_page(&url).await {
            Ok(body) => body,
            Err(err) => {
                warn!(term, page, %err, "results page fetch failed; stopping term");
                break;
            }
        };

        let extraction = extract_page(&body, term, fetcher).await;
        if extraction.cards_seen == 0 {
            debug!(term, page, "no listing cards on page; term exhausted");
            break;
        }
        if extraction.recent_found {
            stale_streak = 0;
        } else {
            stale_streak += 1;
            if stale_streak >= 2 {
                debug!(term, page, "two consecutive stale pages; stopping term");
                break;
            }
        }

        records.extend(extraction.records);
        page += 1;
        tokio::time::sleep(config.page_delay).await;
    }

    records
}

/// Run every search term in order, accumulating all extracted records.
/// Duplicate URLs across pages are possible here; the sinks tolerate them.
pub async fn harvest_all(
    config: &SearchConfig,
    fetcher: &dyn PageFetcher,
    terms: &[&str],
) -> Vec<JobRecord> {
    let mut records = Vec::new();
    for term in terms {
        info!(term, "harvesting recent listings");
        let found = harvest_term(config, fetcher, term).await;
        info!(term, count = found.len(), "term harvested");
        records.extend(found);
    }
    records
}
