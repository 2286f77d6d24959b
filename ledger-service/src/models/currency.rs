//! ISO 4217 minor-unit table.

/// Number of minor units in one major unit, or `None` for unsupported codes.
pub fn subunit_to_unit(code: &str) -> Option<i64> {
    let subunit = match code {
        "BIF" | "CLP" | "DJF" | "GNF" | "ISK" | "JPY" | "KMF" | "KRW" | "PYG" | "RWF" | "UGX"
        | "VND" | "VUV" | "XAF" | "XOF" | "XPF" => 1,
        "BHD" | "IQD" | "JOD" | "KWD" | "LYD" | "OMR" | "TND" => 1000,
        "AED" | "ARS" | "AUD" | "BRL" | "CAD" | "CHF" | "CNY" | "COP" | "CZK" | "DKK" | "EGP"
        | "EUR" | "GBP" | "HKD" | "HUF" | "IDR" | "ILS" | "INR" | "MAD" | "MXN" | "MYR"
        | "NGN" | "NOK" | "NZD" | "PEN" | "PHP" | "PKR" | "PLN" | "RON" | "RUB" | "SAR"
        | "SEK" | "SGD" | "THB" | "TRY" | "TWD" | "UAH" | "USD" | "ZAR" => 100,
        _ => return None,
    };
    Some(subunit)
}
