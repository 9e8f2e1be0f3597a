mod async_step_in;
mod breakpoints;
mod config_file;
mod console_output;
mod exception_filters;
mod internal_exclusion;
mod lifecycle;
mod request_validation;
mod stepping;
