//! SMTP submission transport

pub mod client;

pub use client::{OutgoingAttachment, SmtpClient};
