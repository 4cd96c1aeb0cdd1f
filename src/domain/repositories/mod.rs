pub mod source_client;
