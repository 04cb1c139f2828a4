//! ini-import plumbing: settings travel from the ini file through the environment

extern crate tini;

use log::debug;
use std::env;
use std::fmt::Debug;
use std::str::FromStr;
use tini::Ini;

/// get the ini file reference
pub fn get_ini(path: &str) -> Ini {
    Ini::from_file(path).expect("Failed to open ini file")
}

/// exports ini-value to environment
pub fn ini2env(sec: &str, key: &str, conf: &Ini, exp_key: Option<&str>) {
    let msg = format!("no key [{}]{}", sec, key);
    let value: String = conf.get(sec, key).expect(&msg);
    debug!("{}.{} is {}", sec, key, value);
    match exp_key {
        Some(exp_key) => env::set_var(exp_key, value),
        None => env::set_var(sec.to_owned() + "." + key, value),
    }
}

/// Returns the value from an environment variable
pub fn env2var<T>(exp_key: &str) -> T
where
    T: FromStr,
    <T as FromStr>::Err: Debug,
{
    let msg_miss = format!("No {} as environment variable set", exp_key);
    let msg_parse = format!("Can't parse {} into desired variable", exp_key);
    env::var(exp_key).expect(&msg_miss).parse().expect(&msg_parse)
}

#[cfg(test)]
mod tests {
    use super::env2var;
    use std::env;

    #[test]
    /// Exported values come back typed
    fn env_round_trip() {
        env::set_var("test.batch_size", "10");
        env::set_var("test.debug", "true");
        assert_eq!(env2var::<usize>("test.batch_size"), 10);
        assert!(env2var::<bool>("test.debug"));
    }
}
