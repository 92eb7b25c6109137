use chrono::NaiveDate;
use futures::future::BoxFuture;
use tracing::debug;

use voyage_core::error::CapabilityError;
use voyage_core::traits::{AgentCapability, AgentInput};

use crate::models::{BookingRequest, FlightDetails, PaymentResult};

/// Flight search over an in-process flight table.
///
/// A flight whose payment was just declined is left out of the results, so
/// a re-search after a decline offers the remaining alternatives.
pub struct FlightSearch {
    flights: Vec<FlightDetails>,
    timeout_secs: u64,
}

impl FlightSearch {
    pub fn new(flights: Vec<FlightDetails>) -> Self {
        Self {
            flights,
            timeout_secs: 30,
        }
    }

    /// Search over the built-in sample table.
    pub fn mock() -> Self {
        Self::new(mock_flights())
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    fn search(&self, input: &AgentInput) -> Result<Vec<FlightDetails>, CapabilityError> {
        let request: BookingRequest = input.request_as()?;
        let declined = declined_flight(input);

        let matches: Vec<FlightDetails> = self
            .flights
            .iter()
            .filter(|f| {
                f.origin == request.origin
                    && f.destination == request.destination
                    && f.departure_date == request.travel_date
            })
            .filter(|f| declined.as_deref() != Some(f.flight_number.as_str()))
            .cloned()
            .collect();

        debug!(
            origin = %request.origin,
            destination = %request.destination,
            date = %request.travel_date,
            found = matches.len(),
            "Flight search finished"
        );
        Ok(matches)
    }
}

/// Flight number of the last declined payment, if the previous payment attempt failed.
fn declined_flight(input: &AgentInput) -> Option<String> {
    let payment: PaymentResult = input.slot_as("payment").ok()?;
    if payment.is_confirmed() {
        return None;
    }
    let flight: FlightDetails = input.slot_as("flight").ok()?;
    Some(flight.flight_number)
}

impl AgentCapability for FlightSearch {
    type Output = Vec<FlightDetails>;

    fn name(&self) -> &str {
        "flight_search"
    }

    fn invoke(&self, input: AgentInput) -> BoxFuture<'_, Result<Self::Output, CapabilityError>> {
        Box::pin(async move { self.search(&input) })
    }

    fn validate(&self, output: &Self::Output) -> Result<(), String> {
        output.iter().try_for_each(FlightDetails::check)
    }

    fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }
}

/// The sample flight table.
pub fn mock_flights() -> Vec<FlightDetails> {
    let day = |y, m, d| NaiveDate::from_ymd_opt(y, m, d).unwrap_or_default();
    vec![FlightDetails {
        flight_number: "AA123".to_string(),
        price: 299.99,
        origin: "SFO".to_string(),
        destination: "JFK".to_string(),
        departure_date: day(2024, 5, 1),
        arrival_date: day(2024, 5, 1),
        duration_hours: 5.5,
    }]
}
