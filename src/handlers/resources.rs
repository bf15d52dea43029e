//! Public resource library listing.

use crate::error::ApiResult;
use crate::models::{ResourceInfo, ResourcePage, ResourceQuery};
use crate::pipeline::{HandlerInput, Reply};
use crate::validation::NoInput;

const LIBRARY: [ResourceInfo; 5] = [
    ResourceInfo {
        slug: "tenant-rights",
        title: "Know your rights as a tenant",
        category: "housing",
    },
    ResourceInfo {
        slug: "eviction-notice",
        title: "Responding to an eviction notice",
        category: "housing",
    },
    ResourceInfo {
        slug: "unfair-dismissal",
        title: "Unfair dismissal basics",
        category: "employment",
    },
    ResourceInfo {
        slug: "custody-guide",
        title: "Child custody arrangements",
        category: "family",
    },
    ResourceInfo {
        slug: "visa-renewal",
        title: "Renewing a work visa",
        category: "immigration",
    },
];

/// `GET /resources?page=&limit=&category=`
pub async fn list_resources(mut input: HandlerInput<NoInput, ResourceQuery>) -> ApiResult<Reply> {
    let query = input.take_query()?;
    Reply::data(page_of(&query))
}

fn page_of(query: &ResourceQuery) -> ResourcePage {
    let matching: Vec<&ResourceInfo> = LIBRARY
        .iter()
        .filter(|r| query.category.as_deref().is_none_or(|c| r.category == c))
        .collect();

    ResourcePage {
        total: matching.len(),
        items: matching
            .into_iter()
            .skip(query.offset())
            .take(query.limit as usize)
            .cloned()
            .collect(),
        page: query.page,
        limit: query.limit,
    }
}
