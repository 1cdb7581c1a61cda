pub mod activities;
pub mod config;
pub mod db;
pub mod gateway;
pub mod generator;
pub mod journal;
pub mod model;
pub mod orchestrator;
pub mod service;
pub mod store;
