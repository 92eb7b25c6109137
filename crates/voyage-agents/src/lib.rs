//! Travel booking on top of the Voyage engine: domain models, the three
//! booking agents, and the graph that wires them together.

pub mod booking;
pub mod flight_search;
pub mod models;
pub mod payment;
pub mod seat_select;

pub use booking::{booking_graph, booking_graph_with, BookingSummary, BOOKING_GRAPH};
pub use flight_search::{mock_flights, FlightSearch};
pub use models::{
    BookingFailed, BookingRequest, FlightDetails, PaymentDetails, PaymentResult, SeatPreference,
    SeatRequest,
};
pub use payment::PaymentProcessor;
pub use seat_select::SeatSelector;
