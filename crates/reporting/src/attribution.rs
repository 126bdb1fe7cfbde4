//! Revenue attribution: links each order back to the session that carried the
//! marketing touch, via the customer's email identity.

use funnel_core::types::{
    normalize_email, pages, Diagnostics, Event, EventType, Order, Session, NO_CAMPAIGN,
};
use funnel_core::FunnelError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributionRecord {
    pub order_id: String,
    pub email: String,
    pub campaign: String,
    pub revenue: f64,
    pub currency: String,
    pub source_page: Option<String>,
    pub utm_source: Option<String>,
    pub utm_medium: Option<String>,
    pub matched_session_id: Option<String>,
    pub visited_product_page: bool,
    pub converted_on_product_page: bool,
    /// Distinct pages visited between capture and purchase, in time order,
    /// joined with `" > "`.
    pub intermediate_pages: String,
    pub time_to_convert_hours: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignSummary {
    pub campaign: String,
    pub orders: u64,
    pub revenue: f64,
    pub avg_time_to_convert_hours: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributionReport {
    pub records: Vec<AttributionRecord>,
    pub campaigns: Vec<CampaignSummary>,
    pub total_revenue: f64,
    pub total_orders: u64,
    pub diagnostics: Diagnostics,
}

#[derive(Debug, Clone, Default)]
pub struct AttributionLinker;

impl AttributionLinker {
    pub fn new() -> Self {
        Self
    }

    pub fn link(&self, orders: &[Order], sessions: &[Session], events: &[Event]) -> AttributionReport {
        let mut diagnostics = Diagnostics::default();

        let mut by_email: HashMap<String, Vec<&Session>> = HashMap::new();
        for session in sessions.iter().filter(|s| s.is_well_formed()) {
            if let Some(email) = session.normalized_email() {
                by_email.entry(email).or_default().push(session);
            }
        }
        for list in by_email.values_mut() {
            list.sort_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a.session_id.cmp(&b.session_id))
            });
        }

        let mut events_by_session: HashMap<&str, Vec<&Event>> = HashMap::new();
        for event in events {
            events_by_session
                .entry(event.session_id.as_str())
                .or_default()
                .push(event);
        }

        let mut ordered: Vec<&Order> = Vec::with_capacity(orders.len());
        for order in orders {
            if order.is_well_formed() {
                ordered.push(order);
            } else {
                diagnostics.skipped += 1;
            }
        }
        ordered.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.order_id.cmp(&b.order_id))
        });

        let records: Vec<AttributionRecord> = ordered
            .into_iter()
            .map(|order| {
                let history = normalize_email(&order.email)
                    .and_then(|e| by_email.get(&e))
                    .map(|v| v.as_slice())
                    .unwrap_or(&[]);
                self.link_order(order, history, &events_by_session, &mut diagnostics)
            })
            .collect();

        let total_revenue = records.iter().map(|r| r.revenue).sum();
        let total_orders = records.len() as u64;
        let campaigns = summarize(&records);

        metrics::counter!("attribution.orders").increment(total_orders);
        AttributionReport {
            records,
            campaigns,
            total_revenue,
            total_orders,
            diagnostics,
        }
    }

    /// `history` holds this customer's sessions sorted by creation time.
    fn link_order(
        &self,
        order: &Order,
        history: &[&Session],
        events_by_session: &HashMap<&str, Vec<&Event>>,
        diagnostics: &mut Diagnostics,
    ) -> AttributionRecord {
        let before: Vec<&Session> = history
            .iter()
            .copied()
            .filter(|s| s.created_at <= order.created_at)
            .collect();

        let matched = before.last().copied();
        if let Some(best) = matched {
            let second = best.created_at.timestamp();
            let candidates = before
                .iter()
                .filter(|s| s.created_at.timestamp() == second)
                .count();
            if candidates > 1 {
                let err = FunnelError::AttributionAmbiguous {
                    order_id: order.order_id.clone(),
                    candidates,
                };
                warn!(error = %err, session_id = %best.session_id, "Picked most recent session");
                diagnostics.ambiguous_attributions += 1;
            }
        }

        // An order's own UTM only refines a matched touch.
        let campaign = matched
            .and_then(|s| non_empty(&order.utm_campaign).or_else(|| non_empty(&s.utm_campaign)))
            .unwrap_or_else(|| NO_CAMPAIGN.to_string());
        let utm_source = non_empty(&order.utm_source)
            .or_else(|| matched.and_then(|s| non_empty(&s.utm_source)));
        let utm_medium = non_empty(&order.utm_medium)
            .or_else(|| matched.and_then(|s| non_empty(&s.utm_medium)));

        // Sessions after the capture, or just the matched touch when the
        // customer never left an email through the quiz.
        let capture = before.iter().rev().find(|s| s.submission_id.is_some()).copied();
        let journey: Vec<&Session> = match capture {
            Some(anchor) => before
                .iter()
                .copied()
                .filter(|s| s.created_at > anchor.created_at)
                .collect(),
            None => matched.into_iter().collect(),
        };

        let has_event = |session: &Session, kind: EventType| {
            events_by_session
                .get(session.session_id.as_str())
                .is_some_and(|evs| evs.iter().any(|e| e.event_type == kind))
        };
        let product_sessions: Vec<&Session> = journey
            .iter()
            .copied()
            .filter(|s| s.is_page(pages::PRODUCT) || has_event(s, EventType::ProductPageView))
            .collect();
        let visited_product_page = !product_sessions.is_empty();
        let converted_on_product_page = product_sessions
            .last()
            .is_some_and(|s| has_event(s, EventType::BuyClick));

        let mut intermediate: Vec<&str> = Vec::new();
        for session in &journey {
            if !intermediate.contains(&session.source_page.as_str()) {
                intermediate.push(session.source_page.as_str());
            }
        }

        let time_to_convert_hours = matched.map_or(0.0, |s| {
            let ms = (order.created_at - s.created_at).num_milliseconds().max(0);
            ms as f64 / 3_600_000.0
        });

        if matched.is_none() {
            debug!(order_id = %order.order_id, "No session matched order email");
        }

        AttributionRecord {
            order_id: order.order_id.clone(),
            email: order.email.trim().to_string(),
            campaign,
            revenue: order.revenue,
            currency: order.currency.clone(),
            source_page: matched.map(|s| s.source_page.clone()),
            utm_source,
            utm_medium,
            matched_session_id: matched.map(|s| s.session_id.clone()),
            visited_product_page,
            converted_on_product_page,
            intermediate_pages: intermediate.join(" > "),
            time_to_convert_hours,
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|v| !v.trim().is_empty()).cloned()
}

/// Group records by campaign, highest revenue first.
fn summarize(records: &[AttributionRecord]) -> Vec<CampaignSummary> {
    struct Acc {
        orders: u64,
        revenue: f64,
        matched: u64,
        hours: f64,
    }

    let mut groups: BTreeMap<&str, Acc> = BTreeMap::new();
    for record in records {
        let acc = groups.entry(record.campaign.as_str()).or_insert(Acc {
            orders: 0,
            revenue: 0.0,
            matched: 0,
            hours: 0.0,
        });
        acc.orders += 1;
        acc.revenue += record.revenue;
        if record.matched_session_id.is_some() {
            acc.matched += 1;
            acc.hours += record.time_to_convert_hours;
        }
    }

    let mut summaries: Vec<CampaignSummary> = groups
        .into_iter()
        .map(|(campaign, acc)| CampaignSummary {
            campaign: campaign.to_string(),
            orders: acc.orders,
            revenue: acc.revenue,
            avg_time_to_convert_hours: if acc.matched > 0 {
                acc.hours / acc.matched as f64
            } else {
                0.0
            },
        })
        .collect();
    summaries.sort_by(|a, b| {
        b.revenue
            .total_cmp(&a.revenue)
            .then_with(|| a.campaign.cmp(&b.campaign))
    });
    summaries
}
