use futures::future::BoxFuture;
use tracing::info;

use voyage_core::error::CapabilityError;
use voyage_core::traits::{AgentCapability, AgentInput};

use crate::models::{BookingFailed, FlightDetails, PaymentDetails, PaymentResult, SeatPreference};

/// Card payment for the selected flight and seat.
///
/// Charges above the card limit are declined; the decline is a domain
/// result, not an error, so the graph can route on it.
pub struct PaymentProcessor {
    limit: f64,
    card_last4: String,
    timeout_secs: u64,
}

impl PaymentProcessor {
    pub fn new(limit: f64, card_last4: impl Into<String>) -> Self {
        Self {
            limit,
            card_last4: card_last4.into(),
            timeout_secs: 30,
        }
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    fn charge(&self, flight: &FlightDetails, seat: &SeatPreference) -> PaymentResult {
        if flight.price > self.limit {
            return PaymentResult::Declined(BookingFailed {
                reason: format!(
                    "charge of ${:.2} for {} exceeds the ${:.2} limit on card ending in {}",
                    flight.price, flight.flight_number, self.limit, self.card_last4
                ),
            });
        }

        let confirmation = uuid::Uuid::new_v4().simple().to_string()[..8].to_uppercase();
        info!(
            flight = %flight.flight_number,
            seat = %seat.label(),
            amount = flight.price,
            "Payment confirmed"
        );
        PaymentResult::Confirmed(PaymentDetails {
            total_amount: flight.price,
            payment_method: "credit_card".to_string(),
            confirmation_number: format!("{}-{}", flight.flight_number, confirmation),
        })
    }
}

impl AgentCapability for PaymentProcessor {
    type Output = PaymentResult;

    fn name(&self) -> &str {
        "payment"
    }

    fn invoke(&self, input: AgentInput) -> BoxFuture<'_, Result<Self::Output, CapabilityError>> {
        Box::pin(async move {
            let flight: FlightDetails = input.slot_as("flight")?;
            let seat: SeatPreference = input.slot_as("seat")?;
            Ok(self.charge(&flight, &seat))
        })
    }

    fn validate(&self, output: &Self::Output) -> Result<(), String> {
        match output {
            PaymentResult::Confirmed(details) => {
                if details.total_amount <= 0.0 {
                    return Err("confirmed payment has no amount".into());
                }
                if details.confirmation_number.is_empty() {
                    return Err("confirmed payment has no confirmation number".into());
                }
                Ok(())
            }
            PaymentResult::Declined(failed) if failed.reason.trim().is_empty() => {
                Err("declined payment has no reason".into())
            }
            PaymentResult::Declined(_) => Ok(()),
        }
    }

    fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }
}
