pub mod catalog;
pub mod config;
pub mod database;
pub mod epg;
pub mod errors;
pub mod jobs;
pub mod logging;
pub mod matching;
pub mod models;
pub mod playlist;
pub mod portal;
pub mod scheduler;
pub mod streaming;
pub mod tags;
pub mod web;
