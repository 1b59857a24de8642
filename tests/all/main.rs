mod connection;
mod consumer_manager;
