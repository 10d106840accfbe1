//! Per-student, per-day flags.

use crate::lab::params::STUDENT_TOKEN;
use crate::principal::principal_name;
use chrono::{Local, NaiveDate};
use sha1::{Digest, Sha1};

/// `FLAG{sha1("DDMMYYYY_<email>_<secret>")}` with `${STUDENT}` in the secret
/// replaced by the student's principal name.
///
/// The date is part of the hash, so a flag captured today stops matching
/// once the local date rolls over.
pub fn compute_expected_flag(date: NaiveDate, email: &str, secret_template: &str) -> String {
    let email = email.trim();
    let secret = secret_template.replace(STUDENT_TOKEN, &principal_name(email));
    let input = format!("{}_{}_{}", date.format("%d%m%Y"), email, secret);
    format!("FLAG{{{}}}", hex::encode(Sha1::digest(input.as_bytes())))
}

/// Flag for the current local date
pub fn todays_flag(email: &str, secret_template: &str) -> String {
    compute_expected_flag(Local::now().date_naive(), email, secret_template)
}
