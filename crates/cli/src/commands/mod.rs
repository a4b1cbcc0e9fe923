pub mod doctor;
pub mod extensions;
pub mod onboard;
pub mod run;
