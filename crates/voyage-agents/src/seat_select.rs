use std::collections::HashSet;

use futures::future::BoxFuture;

use voyage_core::error::CapabilityError;
use voyage_core::traits::{AgentCapability, AgentInput};

use crate::models::{
    BookingRequest, FlightDetails, SeatPreference, SeatRequest, EXTRA_LEGROOM_ROWS, MAX_ROW,
};

/// Seat selection against the request's seat preference.
///
/// Picks the first free seat that satisfies as much of the preference as
/// possible: window plus legroom, then legroom, then window, then anything.
pub struct SeatSelector {
    taken: HashSet<String>,
    timeout_secs: u64,
}

impl SeatSelector {
    pub fn new() -> Self {
        Self {
            taken: HashSet::new(),
            timeout_secs: 30,
        }
    }

    /// Mark seats (labels such as `14A`) as already occupied.
    pub fn with_taken<I, S>(mut self, seats: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.taken.extend(seats.into_iter().map(Into::into));
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    fn choose(&self, wanted: &SeatRequest) -> Option<SeatPreference> {
        let all: Vec<u8> = (1..=MAX_ROW).collect();
        let all_rows: &[u8] = &all;
        let legroom_rows: &[u8] = &EXTRA_LEGROOM_ROWS;
        let window: &[char] = &['A', 'F'];
        let any: &[char] = &['A', 'F', 'C', 'D', 'B', 'E'];

        let mut passes: Vec<(&[u8], &[char])> = Vec::new();
        match (wanted.window, wanted.extra_legroom) {
            (true, true) => {
                passes.push((legroom_rows, window));
                passes.push((legroom_rows, any));
                passes.push((all_rows, window));
            }
            (false, true) => passes.push((legroom_rows, any)),
            (true, false) => passes.push((all_rows, window)),
            (false, false) => {}
        }
        passes.push((all_rows, any));

        passes.into_iter().find_map(|(rows, seats)| {
            rows.iter()
                .flat_map(|&row| seats.iter().map(move |&seat| SeatPreference::new(row, seat)))
                .find(|s| !self.taken.contains(&s.label()))
        })
    }
}

impl Default for SeatSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentCapability for SeatSelector {
    type Output = SeatPreference;

    fn name(&self) -> &str {
        "seat_selection"
    }

    fn invoke(&self, input: AgentInput) -> BoxFuture<'_, Result<Self::Output, CapabilityError>> {
        Box::pin(async move {
            let request: BookingRequest = input.request_as()?;
            let flight: FlightDetails = input.slot_as("flight")?;
            self.choose(&request.seat).ok_or_else(|| {
                CapabilityError::fatal(format!("flight {} is fully booked", flight.flight_number))
            })
        })
    }

    fn validate(&self, output: &Self::Output) -> Result<(), String> {
        output.check()?;
        if self.taken.contains(&output.label()) {
            return Err(format!("seat {} is already taken", output.label()));
        }
        Ok(())
    }

    fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }
}
