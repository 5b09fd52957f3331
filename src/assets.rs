// src/assets.rs
use alloy::primitives::{uint, U256};
use rust_decimal::Decimal;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    pub id: U256,
    pub ticker: &'static str,
    pub decimals: u32,
}

/// Assets listed by the protocol, in protocol order.
#[derive(Debug, Clone)]
pub struct AssetTable {
    assets: Vec<Asset>,
    order: Vec<U256>,
}

const UNKNOWN_DECIMALS: u32 = 6;

impl AssetTable {
    pub fn new(assets: Vec<Asset>) -> Self {
        let order = assets.iter().map(|a| a.id).collect();
        Self { assets, order }
    }

    pub fn mainnet() -> Self {
        Self::new(vec![
            Asset {
                id: uint!(11876925370864614464799087627157805050745321306404563164673853337929163193738_U256),
                ticker: "TON",
                decimals: 9,
            },
            Asset {
                id: uint!(91621667903763073563570557639433445791506232618002614896981036659302854767224_U256),
                ticker: "USDT",
                decimals: 6,
            },
            Asset {
                id: uint!(81203563022592193867903899252711112850180680126331353892172221352147647262515_U256),
                ticker: "jUSDT",
                decimals: 6,
            },
            Asset {
                id: uint!(59636546167967198470134647008558085436004969028957957410318094280110082891718_U256),
                ticker: "jUSDC",
                decimals: 6,
            },
            Asset {
                id: uint!(33171510858320790266247832496974106978700190498800858393089426423762035476944_U256),
                ticker: "stTON",
                decimals: 9,
            },
            Asset {
                id: uint!(23103091784861387372100043848078515239542568751939923972799733728526040769767_U256),
                ticker: "tsTON",
                decimals: 9,
            },
        ])
    }

    pub fn order(&self) -> &[U256] {
        &self.order
    }

    pub fn get(&self, id: &U256) -> Option<&Asset> {
        self.assets.iter().find(|a| a.id == *id)
    }

    pub fn ticker(&self, id: &U256) -> &'static str {
        self.get(id).map_or("Unknown", |a| a.ticker)
    }

    /// `1.50 TON`; unlisted assets are shown with jetton precision.
    pub fn friendly_amount(&self, id: &U256, amount: u64) -> String {
        let decimals = self.get(id).map_or(UNKNOWN_DECIMALS, |a| a.decimals);
        let value = Decimal::from_i128_with_scale(amount as i128, decimals).round_dp(2);
        format!("{:.2} {}", value, self.ticker(id))
    }
}
