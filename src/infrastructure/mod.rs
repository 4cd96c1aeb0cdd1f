pub mod tally_client;
