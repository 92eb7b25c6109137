use std::collections::BTreeMap;
use std::sync::Arc;

use voyage_core::config::AppConfig;
use voyage_core::error::Result;
use voyage_core::traits::AgentCapability;
use voyage_engine::backoff::RetryPolicy;
use voyage_engine::graph::{AgentNode, Node, NodeSpec, Route, WorkflowGraph};

use crate::flight_search::FlightSearch;
use crate::models::{FlightDetails, PaymentDetails, PaymentResult, SeatPreference};
use crate::payment::PaymentProcessor;
use crate::seat_select::SeatSelector;

pub const BOOKING_GRAPH: &str = "booking_graph";

pub const SEARCH: &str = "search";
pub const SELECT: &str = "select";
pub const PAY: &str = "pay";

pub const FLIGHT_SLOT: &str = "flight";
pub const SEAT_SLOT: &str = "seat";
pub const PAYMENT_SLOT: &str = "payment";

/// The booking graph over the built-in agents.
///
/// ```text
/// search --found--> select --selected--> pay --confirmed--> (done)
/// search --no_flights--> (failed)
/// pay --declined--> search
/// ```
pub fn booking_graph(config: &AppConfig) -> Result<WorkflowGraph> {
    let timeout = config.agents.timeout_secs;
    booking_graph_with(
        config,
        Arc::new(FlightSearch::mock().with_timeout_secs(timeout)),
        Arc::new(SeatSelector::new().with_timeout_secs(timeout)),
        Arc::new(
            PaymentProcessor::new(config.agents.payment_limit, config.agents.card_last4.clone())
                .with_timeout_secs(timeout),
        ),
    )
}

/// The booking graph over caller-supplied capabilities.
pub fn booking_graph_with<S, T, P>(
    config: &AppConfig,
    search: Arc<S>,
    select: Arc<T>,
    pay: Arc<P>,
) -> Result<WorkflowGraph>
where
    S: AgentCapability<Output = Vec<FlightDetails>>,
    T: AgentCapability<Output = SeatPreference>,
    P: AgentCapability<Output = PaymentResult>,
{
    let retry = |node: &str| RetryPolicy::from_config(&config.retry_for(node));

    let search_node = AgentNode::new(
        NodeSpec::new(SEARCH, "Search Flights")
            .with_slot(FLIGHT_SLOT)
            .with_retry(retry(SEARCH))
            .goto("found", SELECT)
            .fail_on("no_flights"),
        search,
        |flights: &Vec<FlightDetails>| match flights.first() {
            Some(first) => Route::to("found").with_serialized(first),
            None => Route::to("no_flights").because("No flights found"),
        },
    )
    .with_prompt("Find available flights matching the search criteria.");

    let select_node = AgentNode::new(
        NodeSpec::new(SELECT, "Select Seat")
            .with_slot(SEAT_SLOT)
            .with_retry(retry(SELECT))
            .goto("selected", PAY),
        select,
        |_: &SeatPreference| Route::to("selected"),
    )
    .with_prompt(
        "Help the traveller select a seat. Rows 1, 14, and 20 have extra legroom; \
         seats A and F are window seats.",
    )
    .with_inputs(vec![FLIGHT_SLOT.to_string()]);

    let pay_node = AgentNode::new(
        NodeSpec::new(PAY, "Process Payment")
            .with_slot(PAYMENT_SLOT)
            .with_retry(retry(PAY))
            .complete_on("confirmed")
            .goto("declined", SEARCH),
        pay,
        |result: &PaymentResult| match result {
            PaymentResult::Confirmed(_) => Route::to("confirmed"),
            PaymentResult::Declined(failed) => Route::to("declined").because(failed.reason.clone()),
        },
    )
    .with_prompt("Process payment and generate a booking confirmation.")
    .with_inputs(vec![FLIGHT_SLOT.to_string(), SEAT_SLOT.to_string()]);

    let nodes: Vec<Arc<dyn Node>> = vec![
        Arc::new(search_node),
        Arc::new(select_node),
        Arc::new(pay_node),
    ];
    WorkflowGraph::new(BOOKING_GRAPH, SEARCH, nodes)
}

/// A confirmed booking, read back from a completed run's payload.
#[derive(Debug, Clone, PartialEq)]
pub struct BookingSummary {
    pub flight: FlightDetails,
    pub seat: SeatPreference,
    pub payment: PaymentDetails,
}

impl BookingSummary {
    /// `None` unless the payload holds a flight, a seat, and a confirmed payment.
    pub fn from_payload(payload: &BTreeMap<String, serde_json::Value>) -> Option<Self> {
        let decode = |slot: &str| payload.get(slot).cloned();
        let flight = serde_json::from_value(decode(FLIGHT_SLOT)?).ok()?;
        let seat = serde_json::from_value(decode(SEAT_SLOT)?).ok()?;
        match serde_json::from_value(decode(PAYMENT_SLOT)?).ok()? {
            PaymentResult::Confirmed(payment) => Some(Self {
                flight,
                seat,
                payment,
            }),
            PaymentResult::Declined(_) => None,
        }
    }
}

impl std::fmt::Display for BookingSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Booking confirmed!")?;
        writeln!(
            f,
            "  Flight: {} {} -> {} on {}",
            self.flight.flight_number,
            self.flight.origin,
            self.flight.destination,
            self.flight.departure_date
        )?;
        writeln!(f, "  Seat: {}", self.seat.label())?;
        writeln!(f, "  Confirmation number: {}", self.payment.confirmation_number)?;
        writeln!(f, "  Total amount paid: ${:.2}", self.payment.total_amount)?;
        write!(f, "  Payment method: {}", self.payment.payment_method)
    }
}
