pub mod lease_db;
