//! Per-exchange parser specifications
//!
//! A spec is (path accessor, filter predicate, key selector, optional
//! normalizer). Adding an exchange means adding one table entry; no new
//! code paths. Unknown exchanges fall back to a best-effort generic parse.

use lazy_static::lazy_static;
use serde_json::Value;
use std::collections::HashMap;
use tracing::warn;

/// Data-driven parser spec for one exchange's market-list response
#[derive(Clone, Copy)]
pub struct ParserSpec {
    /// Locate the item collection in the response root
    pub path: fn(&Value) -> Option<Vec<Value>>,
    /// Keep only tradeable items
    pub filter: fn(&Value) -> bool,
    /// Field holding the symbol; None when the item itself is the symbol
    pub symbol_key: Option<&'static str>,
    /// Optional symbol normalizer
    pub normalize: Option<fn(String) -> String>,
}

fn path_symbols(d: &Value) -> Option<Vec<Value>> {
    d.get("symbols")?.as_array().cloned()
}

fn path_data(d: &Value) -> Option<Vec<Value>> {
    d.get("data")?.as_array().cloned()
}

fn path_root_array(d: &Value) -> Option<Vec<Value>> {
    d.as_array().cloned()
}

fn path_result_list(d: &Value) -> Option<Vec<Value>> {
    d.get("result")?.get("list")?.as_array().cloned()
}

fn path_result_keys(d: &Value) -> Option<Vec<Value>> {
    Some(
        d.get("result")?
            .as_object()?
            .keys()
            .map(|k| Value::String(k.clone()))
            .collect(),
    )
}

fn path_result_instruments(d: &Value) -> Option<Vec<Value>> {
    d.get("result")?.get("instruments")?.as_array().cloned()
}

fn path_data_symbols(d: &Value) -> Option<Vec<Value>> {
    d.get("data")?.get("symbols")?.as_array().cloned()
}

fn str_field<'a>(item: &'a Value, key: &str) -> Option<&'a str> {
    item.get(key).and_then(Value::as_str)
}

fn accept_all(_item: &Value) -> bool {
    true
}

fn filter_binance(item: &Value) -> bool {
    str_field(item, "status") == Some("TRADING")
}

fn filter_okx(item: &Value) -> bool {
    str_field(item, "state") == Some("live")
}

fn filter_bybit(item: &Value) -> bool {
    str_field(item, "status") == Some("Trading")
}

fn filter_kucoin(item: &Value) -> bool {
    item.get("enableTrading").and_then(Value::as_bool).unwrap_or(true)
}

fn filter_gate(item: &Value) -> bool {
    str_field(item, "trade_status") == Some("tradable")
}

fn filter_bitget(item: &Value) -> bool {
    str_field(item, "status") == Some("online")
}

fn filter_htx(item: &Value) -> bool {
    matches!(str_field(item, "state"), Some("online") | Some("pre-online"))
}

fn filter_mexc(item: &Value) -> bool {
    let status_ok = match item.get("status") {
        Some(Value::String(s)) => s == "1" || s == "ENABLED",
        Some(Value::Number(n)) => n.as_i64() == Some(1),
        _ => false,
    };
    let spot_ok = item
        .get("isSpotTradingAllowed")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let ascii_ok = str_field(item, "symbol").map(|s| s.is_ascii()).unwrap_or(false);
    status_ok && spot_ok && ascii_ok
}

fn filter_coinbase(item: &Value) -> bool {
    str_field(item, "status") == Some("online")
}

fn filter_poloniex(item: &Value) -> bool {
    str_field(item, "state") == Some("NORMAL")
}

fn normalize_upper(s: String) -> String {
    s.to_uppercase()
}

lazy_static! {
    /// The exchange parser table
    pub static ref EXCHANGE_PARSERS: HashMap<&'static str, ParserSpec> = {
        let mut table: HashMap<&'static str, ParserSpec> = HashMap::new();
        table.insert("binance", ParserSpec {
            path: path_symbols,
            filter: filter_binance,
            symbol_key: Some("symbol"),
            normalize: None,
        });
        table.insert("okx", ParserSpec {
            path: path_data,
            filter: filter_okx,
            symbol_key: Some("instId"),
            normalize: None,
        });
        table.insert("bybit", ParserSpec {
            path: path_result_list,
            filter: filter_bybit,
            symbol_key: Some("symbol"),
            normalize: None,
        });
        table.insert("kucoin", ParserSpec {
            path: path_data,
            filter: filter_kucoin,
            symbol_key: Some("symbol"),
            normalize: None,
        });
        table.insert("gate", ParserSpec {
            path: path_root_array,
            filter: filter_gate,
            symbol_key: Some("id"),
            normalize: None,
        });
        table.insert("bitget", ParserSpec {
            path: path_data,
            filter: filter_bitget,
            symbol_key: Some("symbol"),
            normalize: None,
        });
        table.insert("htx", ParserSpec {
            path: path_data,
            filter: filter_htx,
            symbol_key: Some("symbol"),
            normalize: Some(normalize_upper),
        });
        table.insert("mexc", ParserSpec {
            path: path_symbols,
            filter: filter_mexc,
            symbol_key: Some("symbol"),
            normalize: None,
        });
        table.insert("coinbase", ParserSpec {
            path: path_root_array,
            filter: filter_coinbase,
            symbol_key: Some("id"),
            normalize: None,
        });
        table.insert("kraken", ParserSpec {
            path: path_result_keys,
            filter: accept_all,
            symbol_key: None,
            normalize: None,
        });
        table.insert("cryptocom", ParserSpec {
            path: path_result_instruments,
            filter: accept_all,
            symbol_key: Some("instrument_name"),
            normalize: None,
        });
        table.insert("bitmart", ParserSpec {
            path: path_data_symbols,
            filter: accept_all,
            symbol_key: Some("symbol"),
            normalize: None,
        });
        table.insert("lbank", ParserSpec {
            path: path_data,
            filter: accept_all,
            symbol_key: None,
            normalize: Some(normalize_upper),
        });
        table.insert("poloniex", ParserSpec {
            path: path_root_array,
            filter: filter_poloniex,
            symbol_key: Some("symbol"),
            normalize: None,
        });
        table
    };
}

/// Parse a market-list response into pair symbols using the exchange's spec
pub fn parse_symbols(exchange: &str, data: &Value) -> Vec<String> {
    let spec = match EXCHANGE_PARSERS.get(exchange) {
        Some(spec) => *spec,
        None => {
            warn!("no parser spec for {}, using generic parse", exchange);
            return generic_parse(data);
        }
    };

    let items = match (spec.path)(data) {
        Some(items) => items,
        None => return Vec::new(),
    };

    let mut symbols = Vec::new();
    for item in &items {
        if !(spec.filter)(item) {
            continue;
        }
        let symbol = match spec.symbol_key {
            Some(key) => str_field(item, key).unwrap_or_default().to_string(),
            None => item.as_str().unwrap_or_default().to_string(),
        };
        if symbol.is_empty() {
            continue;
        }
        let symbol = match spec.normalize {
            Some(f) => f(symbol),
            None => symbol,
        };
        symbols.push(symbol);
    }
    symbols
}

/// Best-effort parse for exchanges without a spec
fn generic_parse(data: &Value) -> Vec<String> {
    let items = if let Some(arr) = data.as_array() {
        arr.clone()
    } else if let Some(arr) = data.get("data").and_then(Value::as_array) {
        arr.clone()
    } else if let Some(arr) = data.get("symbols").and_then(Value::as_array) {
        arr.clone()
    } else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| {
            item.get("symbol")
                .or_else(|| item.get("id"))
                .and_then(Value::as_str)
                .map(String::from)
                .or_else(|| item.as_str().map(String::from))
        })
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_binance_spec() {
        let data = json!({
            "symbols": [
                {"symbol": "NEWUSDT", "status": "TRADING"},
                {"symbol": "OLDUSDT", "status": "BREAK"},
            ]
        });
        assert_eq!(parse_symbols("binance", &data), vec!["NEWUSDT"]);
    }

    #[test]
    fn test_okx_spec() {
        let data = json!({
            "data": [
                {"instId": "NEW-USDT", "state": "live"},
                {"instId": "DEAD-USDT", "state": "suspend"},
            ]
        });
        assert_eq!(parse_symbols("okx", &data), vec!["NEW-USDT"]);
    }

    #[test]
    fn test_bybit_nested_path() {
        let data = json!({
            "result": { "list": [
                {"symbol": "ABCUSDT", "status": "Trading"},
                {"symbol": "XYZUSDT", "status": "PreLaunch"},
            ]}
        });
        assert_eq!(parse_symbols("bybit", &data), vec!["ABCUSDT"]);
    }

    #[test]
    fn test_kraken_keys_as_symbols() {
        let data = json!({"result": {"XXBTZUSD": {}, "XETHZUSD": {}}});
        let mut symbols = parse_symbols("kraken", &data);
        symbols.sort();
        assert_eq!(symbols, vec!["XETHZUSD", "XXBTZUSD"]);
    }

    #[test]
    fn test_lbank_bare_strings_uppercased() {
        let data = json!({"data": ["abc_usdt", "def_usdt"]});
        assert_eq!(parse_symbols("lbank", &data), vec!["ABC_USDT", "DEF_USDT"]);
    }

    #[test]
    fn test_htx_normalizer() {
        let data = json!({
            "data": [
                {"symbol": "newusdt", "state": "online"},
                {"symbol": "preusdt", "state": "pre-online"},
                {"symbol": "offusdt", "state": "offline"},
            ]
        });
        assert_eq!(parse_symbols("htx", &data), vec!["NEWUSDT", "PREUSDT"]);
    }

    #[test]
    fn test_mexc_requires_spot_ascii() {
        let data = json!({
            "symbols": [
                {"symbol": "GOODUSDT", "status": "1", "isSpotTradingAllowed": true},
                {"symbol": "NOSPOTUSDT", "status": "1", "isSpotTradingAllowed": false},
                {"symbol": "数字USDT", "status": "1", "isSpotTradingAllowed": true},
            ]
        });
        assert_eq!(parse_symbols("mexc", &data), vec!["GOODUSDT"]);
    }

    #[test]
    fn test_generic_fallback() {
        let data = json!({"data": [{"symbol": "AAA"}, {"symbol": "BBB"}]});
        assert_eq!(parse_symbols("nosuchexchange", &data), vec!["AAA", "BBB"]);
    }

    #[test]
    fn test_malformed_response_yields_empty() {
        assert!(parse_symbols("binance", &json!({"weird": true})).is_empty());
        assert!(parse_symbols("bybit", &json!([1, 2, 3])).is_empty());
    }
}
