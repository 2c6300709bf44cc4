pub mod hostnetwork;
