use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Rows with extra legroom (exit rows and bulkhead).
pub const EXTRA_LEGROOM_ROWS: [u8; 3] = [1, 14, 20];
pub const MAX_ROW: u8 = 30;

/// Details of a flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlightDetails {
    /// Carrier code plus number, e.g. `AA123`.
    pub flight_number: String,
    /// Price in USD.
    pub price: f64,
    /// IATA code of the departure airport.
    pub origin: String,
    /// IATA code of the arrival airport.
    pub destination: String,
    pub departure_date: NaiveDate,
    pub arrival_date: NaiveDate,
    pub duration_hours: f64,
}

impl FlightDetails {
    pub fn check(&self) -> Result<(), String> {
        if self.flight_number.trim().is_empty() {
            return Err("flight number is empty".into());
        }
        if !is_iata(&self.origin) || !is_iata(&self.destination) {
            return Err(format!(
                "flight {} has invalid airports {} -> {}",
                self.flight_number, self.origin, self.destination
            ));
        }
        if self.price <= 0.0 {
            return Err(format!("flight {} has non-positive price", self.flight_number));
        }
        if self.arrival_date < self.departure_date {
            return Err(format!("flight {} arrives before it departs", self.flight_number));
        }
        Ok(())
    }
}

fn is_iata(code: &str) -> bool {
    code.len() == 3 && code.chars().all(|c| c.is_ascii_uppercase())
}

/// A concrete seat on the aircraft.
///
/// Seats A and F are window seats, B and E middle, C and D aisle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeatPreference {
    pub row: u8,
    pub seat: char,
    pub is_window: bool,
    pub is_extra_legroom: bool,
}

impl SeatPreference {
    /// Seat at `row`/`seat` with its flags derived from the cabin layout.
    pub fn new(row: u8, seat: char) -> Self {
        Self {
            row,
            seat,
            is_window: matches!(seat, 'A' | 'F'),
            is_extra_legroom: EXTRA_LEGROOM_ROWS.contains(&row),
        }
    }

    /// Seat label such as `14A`.
    pub fn label(&self) -> String {
        format!("{}{}", self.row, self.seat)
    }

    pub fn check(&self) -> Result<(), String> {
        if !(1..=MAX_ROW).contains(&self.row) {
            return Err(format!("row {} is outside 1-{}", self.row, MAX_ROW));
        }
        if !('A'..='F').contains(&self.seat) {
            return Err(format!("seat '{}' is not A-F", self.seat));
        }
        if self.is_window != matches!(self.seat, 'A' | 'F') {
            return Err(format!("seat {} has the wrong window flag", self.label()));
        }
        if self.is_extra_legroom != EXTRA_LEGROOM_ROWS.contains(&self.row) {
            return Err(format!("seat {} has the wrong legroom flag", self.label()));
        }
        Ok(())
    }
}

/// What the traveller asked for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeatRequest {
    #[serde(default = "default_true")]
    pub window: bool,
    #[serde(default = "default_true")]
    pub extra_legroom: bool,
}

impl Default for SeatRequest {
    fn default() -> Self {
        Self {
            window: true,
            extra_legroom: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// A booking request as submitted to the booking graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingRequest {
    pub origin: String,
    pub destination: String,
    pub travel_date: NaiveDate,
    #[serde(default)]
    pub seat: SeatRequest,
}

impl BookingRequest {
    pub fn new(
        origin: impl Into<String>,
        destination: impl Into<String>,
        travel_date: NaiveDate,
    ) -> Self {
        Self {
            origin: origin.into(),
            destination: destination.into(),
            travel_date,
            seat: SeatRequest::default(),
        }
    }

    pub fn with_seat(mut self, seat: SeatRequest) -> Self {
        self.seat = seat;
        self
    }
}

/// Payment processing details.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentDetails {
    pub total_amount: f64,
    /// e.g. `credit_card`.
    pub payment_method: String,
    pub confirmation_number: String,
}

/// Why a booking could not be completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingFailed {
    pub reason: String,
}

/// Result of the payment step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PaymentResult {
    Confirmed(PaymentDetails),
    Declined(BookingFailed),
}

impl PaymentResult {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, Self::Confirmed(_))
    }
}
