//! chameleon: a local intercepting HTTPS proxy that translates between the
//! Anthropic Messages, OpenAI Chat Completions and Google Gemini
//! generateContent dialects.
//!
//! Clients keep speaking the dialect they were built for; the proxy
//! terminates TLS for configured endpoints with leaves signed by its own
//! root CA, picks an upstream channel by load balancing, and converts
//! requests, responses and event streams between dialects.

pub mod certificate;
pub mod channel;
pub mod config;
pub mod convert;
pub mod error;
pub mod hosts;
pub mod server;
pub mod statistics;
