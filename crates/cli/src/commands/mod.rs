pub mod check_tools;
pub mod inspect;
pub mod run;
