use crate::{
    error::MetadataError,
    library::{DataSource, ModId},
    store::MetadataStore,
};
use serde::Deserialize;
use std::{collections::HashMap, time::Duration};
use tracing::{debug, info};

/// Steam rejects larger GetDetails batches.
pub const DETAILS_BATCH_LIMIT: usize = 215;
const QUERY_FILES_URL: &str = "https://api.steampowered.com/IPublishedFileService/QueryFiles/v1/";
const GET_DETAILS_URL: &str = "https://api.steampowered.com/IPublishedFileService/GetDetails/v1/";
const USER_AGENT: &str = "modsmith";
const PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryFilesPage {
    pub total: u64,
    pub ids: Vec<String>,
    pub next_cursor: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ChildRef {
    pub publishedfileid: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PublishedFileDetails {
    pub publishedfileid: String,
    #[serde(default)]
    pub result: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub time_created: Option<i64>,
    #[serde(default)]
    pub time_updated: Option<i64>,
    #[serde(default)]
    pub children: Vec<ChildRef>,
}

impl PublishedFileDetails {
    /// Steam's `result` is 1 for a live, visible item.
    pub fn is_available(&self) -> bool {
        self.result == 1
    }
}

pub trait WorkshopApi {
    fn query_files(&self, app_id: u32, cursor: &str) -> Result<QueryFilesPage, MetadataError>;

    /// At most `DETAILS_BATCH_LIMIT` ids per call.
    fn get_details(&self, app_id: u32, ids: &[String]) -> Result<Vec<PublishedFileDetails>, MetadataError>;
}

/// Steam Web API client on `ureq`.
pub struct SteamWebApi {
    key: String,
    agent: ureq::Agent,
}

impl SteamWebApi {
    pub fn new(key: &str) -> Result<Self, MetadataError> {
        let key = key.trim();
        if key.len() != 32 {
            return Err(MetadataError::configuration(
                "Steam API key",
                format!("expected 32 characters, got {}", key.len()),
            ));
        }
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(5))
            .timeout_read(Duration::from_secs(30))
            .timeout_write(Duration::from_secs(10))
            .build();
        Ok(Self {
            key: key.to_string(),
            agent,
        })
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    response: T,
}

#[derive(Debug, Default, Deserialize)]
struct QueryFilesResponse {
    #[serde(default)]
    total: u64,
    #[serde(default)]
    publishedfiledetails: Vec<PublishedFileDetails>,
    #[serde(default)]
    next_cursor: String,
}

#[derive(Debug, Default, Deserialize)]
struct DetailsResponse {
    #[serde(default)]
    publishedfiledetails: Vec<PublishedFileDetails>,
}

impl WorkshopApi for SteamWebApi {
    fn query_files(&self, app_id: u32, cursor: &str) -> Result<QueryFilesPage, MetadataError> {
        let app_id = app_id.to_string();
        let page_size = PAGE_SIZE.to_string();
        let response = self
            .agent
            .get(QUERY_FILES_URL)
            .set("User-Agent", USER_AGENT)
            .query("key", &self.key)
            .query("query_type", "1")
            .query("cursor", cursor)
            .query("numperpage", &page_size)
            .query("creator_appid", &app_id)
            .query("appid", &app_id)
            .query("ids_only", "true")
            .call()?;
        let body: Envelope<QueryFilesResponse> = response
            .into_json()
            .map_err(|err| MetadataError::RemoteFetch(format!("decode QueryFiles: {err}")))?;
        Ok(QueryFilesPage {
            total: body.response.total,
            ids: body
                .response
                .publishedfiledetails
                .into_iter()
                .map(|details| details.publishedfileid)
                .collect(),
            next_cursor: body.response.next_cursor,
        })
    }

    fn get_details(&self, app_id: u32, ids: &[String]) -> Result<Vec<PublishedFileDetails>, MetadataError> {
        let mut request = self
            .agent
            .get(GET_DETAILS_URL)
            .set("User-Agent", USER_AGENT)
            .query("key", &self.key)
            .query("appid", &app_id.to_string())
            .query("includechildren", "true");
        for (index, id) in ids.iter().enumerate() {
            request = request.query(&format!("publishedfileids[{index}]"), id);
        }
        let body: Envelope<DetailsResponse> = request
            .call()?
            .into_json()
            .map_err(|err| MetadataError::RemoteFetch(format!("decode GetDetails: {err}")))?;
        Ok(body.response.publishedfiledetails)
    }
}

/// Fetches details for any number of ids, `DETAILS_BATCH_LIMIT` at a time.
pub fn get_details_chunked<A: WorkshopApi + ?Sized>(
    api: &A,
    app_id: u32,
    ids: &[String],
) -> Result<Vec<PublishedFileDetails>, MetadataError> {
    let mut out = Vec::with_capacity(ids.len());
    for chunk in ids.chunks(DETAILS_BATCH_LIMIT) {
        out.extend(api.get_details(app_id, chunk)?);
    }
    Ok(out)
}

/// Stores remote created/updated timestamps on Workshop records.
pub fn refresh_workshop_times<A: WorkshopApi + ?Sized>(
    store: &mut MetadataStore,
    api: &A,
    app_id: u32,
) -> Result<usize, MetadataError> {
    let mut by_pfid: HashMap<String, Vec<ModId>> = HashMap::new();
    for record in store.records() {
        if record.data_source != DataSource::Workshop {
            continue;
        }
        if let Some(pfid) = &record.published_file_id {
            by_pfid.entry(pfid.clone()).or_default().push(record.id);
        }
    }
    if by_pfid.is_empty() {
        debug!("No workshop mods to query");
        return Ok(0);
    }

    let mut ids: Vec<String> = by_pfid.keys().cloned().collect();
    ids.sort();
    let details = get_details_chunked(api, app_id, &ids)?;
    let mut updated = 0;
    for details in details.into_iter().filter(PublishedFileDetails::is_available) {
        let Some(targets) = by_pfid.get(&details.publishedfileid) else {
            continue;
        };
        for id in targets {
            if let Some(record) = store.get_mut(*id) {
                record.remote_time_created = details.time_created;
                record.remote_time_updated = details.time_updated;
                updated += 1;
            }
        }
    }
    info!("Updated remote timestamps for {updated} workshop mods");
    Ok(updated)
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::{cell::RefCell, collections::BTreeMap};

    /// Serves pages and details from memory and records every call.
    #[derive(Default)]
    pub struct FakeWorkshop {
        pub pages: BTreeMap<String, QueryFilesPage>,
        pub details: BTreeMap<String, PublishedFileDetails>,
        pub detail_calls: RefCell<Vec<usize>>,
        pub query_calls: RefCell<Vec<String>>,
    }

    impl FakeWorkshop {
        pub fn with_item(mut self, id: &str, title: &str, children: &[&str]) -> Self {
            self.details.insert(
                id.to_string(),
                PublishedFileDetails {
                    publishedfileid: id.to_string(),
                    result: 1,
                    title: title.to_string(),
                    time_created: Some(10),
                    time_updated: Some(20),
                    children: children
                        .iter()
                        .map(|child| ChildRef {
                            publishedfileid: child.to_string(),
                        })
                        .collect(),
                },
            );
            self
        }
    }

    impl WorkshopApi for FakeWorkshop {
        fn query_files(&self, _app_id: u32, cursor: &str) -> Result<QueryFilesPage, MetadataError> {
            self.query_calls.borrow_mut().push(cursor.to_string());
            Ok(self.pages.get(cursor).cloned().unwrap_or_default())
        }

        fn get_details(&self, _app_id: u32, ids: &[String]) -> Result<Vec<PublishedFileDetails>, MetadataError> {
            assert!(ids.len() <= DETAILS_BATCH_LIMIT);
            self.detail_calls.borrow_mut().push(ids.len());
            Ok(ids
                .iter()
                .map(|id| {
                    self.details.get(id).cloned().unwrap_or(PublishedFileDetails {
                        publishedfileid: id.clone(),
                        result: 9,
                        ..PublishedFileDetails::default()
                    })
                })
                .collect())
        }
    }
}
