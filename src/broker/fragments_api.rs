//! The Fragments listing API: resolve a journal, reconcile its
//! fragments across backing stores, and serve stably ordered pages of
//! signed-URL tuples.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::BrokerError;
use crate::fragment::{CoverSet, Fragment, StoreAdapter, walk_all_stores};
use crate::journal::{Journal, JournalSpec};

pub const DEFAULT_SIGNATURE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_PAGE_LIMIT: i32 = 100;

/// Response status of a fragments request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    #[default]
    Ok,
    /// The journal's flags forbid reads.
    NotAllowed,
    NoJournalPrimary,
    NoJournalReplica,
}

/// Routing metadata resolved for the journal, echoed to the caller and
/// attached to forwarded requests.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteHeader {
    pub process_id: String,
    pub route: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FragmentsRequest {
    pub journal: Journal,
    /// Lower bound (inclusive) on fragment modification time, in Unix
    /// seconds. Zero means unbounded.
    pub begin: i64,
    /// Upper bound (inclusive); zero means unbounded.
    pub end: i64,
    /// Byte offset from which to resume listing.
    pub page_token: i64,
    /// Maximum tuples per page; zero selects the default.
    pub page_limit: i32,
    /// TTL of returned signed URLs; defaults to 24 hours.
    pub signature_ttl: Option<Duration>,
    pub do_not_proxy: bool,
    pub header: Option<RouteHeader>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FragmentsResponse {
    pub status: Status,
    pub header: RouteHeader,
    pub fragments: Vec<FragmentTuple>,
    /// Token resuming the listing where this page left off.
    pub page_token: i64,
}

/// A listed fragment and, when persisted, a signed URL for its content.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FragmentTuple {
    pub fragment: Fragment,
    pub signed_url: Option<String>,
}

/// Outcome of resolving a journal to a serving broker.
pub enum Resolution {
    /// This process replicates the journal and serves the read locally.
    Local {
        header: RouteHeader,
        spec: Arc<JournalSpec>,
    },
    /// Another process owns the journal; forward there.
    Remote { header: RouteHeader },
    /// No replica can serve the request.
    Failed { status: Status, header: RouteHeader },
}

pub trait Resolver: Send + Sync {
    fn resolve(
        &self,
        journal: &Journal,
        may_proxy: bool,
        header: Option<&RouteHeader>,
    ) -> Resolution;
}

/// Client used to forward a fragments request to the resolved owner.
pub trait FragmentsProxy: Send + Sync {
    fn fragments(&self, req: FragmentsRequest) -> Result<FragmentsResponse, BrokerError>;
}

/// Serves the Fragments API for journals this process replicates.
pub struct FragmentsService {
    resolver: Arc<dyn Resolver>,
    adapter: Arc<dyn StoreAdapter>,
    proxy: Option<Arc<dyn FragmentsProxy>>,
}

impl FragmentsService {
    pub fn new(
        resolver: Arc<dyn Resolver>,
        adapter: Arc<dyn StoreAdapter>,
        proxy: Option<Arc<dyn FragmentsProxy>>,
    ) -> Self {
        Self {
            resolver,
            adapter,
            proxy,
        }
    }

    pub fn fragments(&self, mut req: FragmentsRequest) -> Result<FragmentsResponse, BrokerError> {
        validate(&req)?;

        match self
            .resolver
            .resolve(&req.journal, !req.do_not_proxy, req.header.as_ref())
        {
            Resolution::Failed { status, header } => Ok(FragmentsResponse {
                status,
                header,
                fragments: Vec::new(),
                page_token: req.page_token,
            }),
            Resolution::Remote { header } => {
                let proxy = self.proxy.as_ref().ok_or(BrokerError::NoProxy)?;
                req.header = Some(header);
                proxy.fragments(req)
            }
            Resolution::Local { header, spec } => {
                if !spec.flags.may_read() {
                    return Ok(FragmentsResponse {
                        status: Status::NotAllowed,
                        header,
                        fragments: Vec::new(),
                        page_token: req.page_token,
                    });
                }
                self.serve_fragments(req, &spec, header)
            }
        }
    }

    fn serve_fragments(
        &self,
        req: FragmentsRequest,
        spec: &JournalSpec,
        header: RouteHeader,
    ) -> Result<FragmentsResponse, BrokerError> {
        let set = walk_all_stores(&req.journal, &spec.stores, self.adapter.as_ref())?;
        let fragments = fragment_tuples(&req, &set, self.adapter.as_ref())?;

        // Pages describe contiguous byte spans: the next page resumes
        // one past the last returned fragment. An empty page echoes the
        // input token.
        let page_token = fragments
            .last()
            .map(|tuple| tuple.fragment.end + 1)
            .unwrap_or(req.page_token);

        Ok(FragmentsResponse {
            status: Status::Ok,
            header,
            fragments,
            page_token,
        })
    }
}

fn validate(req: &FragmentsRequest) -> Result<(), BrokerError> {
    if req.journal.is_empty() {
        return Err(BrokerError::InvalidRequest {
            reason: "journal is empty".to_string(),
        });
    }
    if req.page_limit < 0 || req.page_token < 0 || req.begin < 0 || req.end < 0 {
        return Err(BrokerError::InvalidRequest {
            reason: "negative field".to_string(),
        });
    }
    if req.end != 0 && req.begin > req.end {
        return Err(BrokerError::InvalidRequest {
            reason: "begin is after end".to_string(),
        });
    }
    Ok(())
}

/// Page over `set`, collecting fragments within the request's
/// modification-time window into signed tuples.
pub(crate) fn fragment_tuples(
    req: &FragmentsRequest,
    set: &CoverSet,
    adapter: &dyn StoreAdapter,
) -> Result<Vec<FragmentTuple>, BrokerError> {
    let ttl = req.signature_ttl.unwrap_or(DEFAULT_SIGNATURE_TTL);
    let limit = if req.page_limit == 0 {
        DEFAULT_PAGE_LIMIT as usize
    } else {
        req.page_limit as usize
    };
    let mut tuples = Vec::new();

    // Offsets preceding the page token were returned by prior pages.
    let (mut ind, found) = set.longest_overlapping_fragment(req.page_token);
    if !found && ind == set.len() {
        return Ok(tuples);
    }

    // Advance to the first fragment modified at or after `begin`. The
    // set is ordered by offset rather than by modification time, and a
    // page must describe a contiguous chunk of the journal, so once a
    // fragment passes this check only the `end` bound is evaluated:
    // out-of-order fragments are picked up by subsequent pages.
    while set[ind].mod_time < req.begin {
        ind += 1;
        if ind == set.len() {
            return Ok(tuples);
        }
    }

    for fragment in &set.as_slice()[ind..] {
        if tuples.len() == limit {
            break;
        }
        let live = fragment.backing_store.is_none() && fragment.mod_time == 0;

        if req.end == 0 && live {
            // An unbounded query includes the live fragment, for which
            // no URL can be signed yet.
            tuples.push(FragmentTuple {
                fragment: fragment.clone(),
                signed_url: None,
            });
            continue;
        }
        if req.end != 0 && (live || fragment.mod_time > req.end) {
            // Past the window's end: nothing persisted further along
            // belongs to this page.
            break;
        }

        let signed_url = match &fragment.backing_store {
            Some(store) => Some(adapter.sign_get_url(store, fragment, ttl)?),
            None => None,
        };
        tuples.push(FragmentTuple {
            fragment: fragment.clone(),
            signed_url,
        });
    }
    Ok(tuples)
}
