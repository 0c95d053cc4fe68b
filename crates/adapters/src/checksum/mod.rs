pub mod classifier_checksum;
