pub mod controller;
mod sync;

pub use controller::run;
