//! `ballotbox gen-secret`: print a fresh master secret.

use rand::RngCore;

pub fn execute() {
    let mut secret = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut secret);
    println!("{}", hex::encode(secret));
}
