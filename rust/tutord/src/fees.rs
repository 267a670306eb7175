use chrono::{Months, NaiveDate};
use serde::{Deserialize, Deserializer, Serialize};

pub const GST_PERCENTAGE: u32 = 18;
pub const MULTI_SUBJECT_THRESHOLD: usize = 3;
pub const MULTI_SUBJECT_DISCOUNT_PERCENTAGE: u32 = 10;
pub const SCHOLARSHIP_PERCENTAGES: [u32; 5] = [10, 20, 30, 40, 50];
pub const INSTALLMENT_COUNT: u32 = 3;

pub const ONLINE_BRANCH: &str = "Online";
pub const ONLINE_MONTHLY_RATE: f64 = 1500.0;
/// Rate for boards missing from the table; same as the lowest tier.
pub const DEFAULT_MONTHLY_RATE: f64 = 700.0;

/// Foreign-currency display carries a fixed 3% markup over the supplied rate.
pub const DISPLAY_MARKUP: f64 = 1.03;

const BOARD_MONTHLY_RATES: [(&str, f64); 5] = [
    ("SSC", 700.0),
    ("CBSE", 800.0),
    ("ICSE", 900.0),
    ("IGCSE", 1200.0),
    ("IB", 1500.0),
];

const EARLY_GRADES: [&str; 8] = [
    "nursery", "playgroup", "lkg", "ukg", "jr kg", "sr kg", "kg", "1",
];

const DAYS_PER_MONTH: f64 = 30.0;
const GRADE_STEP: f64 = 1.1;
/// Highest numeric grade the rate table is defined for.
pub const MAX_NUMERIC_GRADE: i32 = 15;

/// Half-up rounding to a whole currency unit: `floor(x + 0.5)`.
pub fn round_half_up(x: f64) -> i64 {
    (x + 0.5).floor() as i64
}

fn round_2(x: f64) -> f64 {
    (x * 100.0 + 0.5).floor() / 100.0
}

pub fn is_valid_scholarship_percentage(p: u32) -> bool {
    SCHOLARSHIP_PERCENTAGES.contains(&p)
}

pub fn is_valid_one_to_one_percentage(p: u32) -> bool {
    (10..=200).contains(&p) && p % 10 == 0
}

/// Accepts `YYYY-MM-DD` as well as full ISO datetimes, keeping only the date.
pub fn parse_date_lenient(raw: &str) -> Option<NaiveDate> {
    let t = raw.trim();
    if let Ok(d) = NaiveDate::parse_from_str(t, "%Y-%m-%d") {
        return Some(d);
    }
    let head = t.get(..10)?;
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}

fn lenient_date<'de, D>(d: D) -> Result<Option<NaiveDate>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Option::<serde_json::Value>::deserialize(d)?;
    Ok(v.as_ref()
        .and_then(|v| v.as_str())
        .and_then(parse_date_lenient))
}

fn lenient_amount<'de, D>(d: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Option::<serde_json::Value>::deserialize(d)?;
    let n = match v {
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    Ok(n.filter(|x| x.is_finite() && *x > 0.0))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectSelection {
    pub name: String,
    #[serde(default, deserialize_with = "lenient_date")]
    pub start_date: Option<NaiveDate>,
    #[serde(default, deserialize_with = "lenient_date")]
    pub end_date: Option<NaiveDate>,
}

impl SubjectSelection {
    /// Inclusive day count, or `None` when the selection cannot be priced
    /// (a date is missing or the range is inverted).
    pub fn billable_days(&self) -> Option<i64> {
        let (start, end) = (self.start_date?, self.end_date?);
        let days = end.signed_duration_since(start).num_days() + 1;
        if days > 0 {
            Some(days)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FeeContext {
    pub board: String,
    pub branch: String,
    pub grade: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FeeToggles {
    pub gst_applied: bool,
    pub scholarship_applied: bool,
    pub scholarship_percentage: u32,
    pub one_to_one_applied: bool,
    pub one_to_one_percentage: u32,
    #[serde(
        deserialize_with = "lenient_amount",
        skip_serializing_if = "Option::is_none"
    )]
    pub custom_total_amount: Option<f64>,
}

impl FeeToggles {
    /// Percentages only have to be in their fixed sets when the toggle is on.
    pub fn validate(&self) -> Result<(), String> {
        if self.scholarship_applied && !is_valid_scholarship_percentage(self.scholarship_percentage)
        {
            return Err(format!(
                "scholarshipPercentage must be one of {:?}",
                SCHOLARSHIP_PERCENTAGES
            ));
        }
        if self.one_to_one_applied && !is_valid_one_to_one_percentage(self.one_to_one_percentage) {
            return Err("oneToOnePercentage must be a multiple of 10 in 10..=200".to_string());
        }
        Ok(())
    }

    fn custom_total(&self) -> Option<i64> {
        self.custom_total_amount
            .map(round_half_up)
            .filter(|v| *v > 0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectFee {
    pub subject: String,
    pub fee: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Discount {
    pub percentage: u32,
    pub amount: i64,
}

impl Discount {
    fn of(subtotal: i64, percentage: u32) -> Self {
        Self {
            percentage,
            amount: round_half_up(subtotal as f64 * percentage as f64 / 100.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Installment {
    pub amount: i64,
    pub due_date: NaiveDate,
    pub paid: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeBreakdown {
    pub subject_fees: Vec<SubjectFee>,
    pub subtotal: i64,
    pub subject_discount: Discount,
    pub scholarship_discount: Discount,
    pub base_amount: i64,
    pub gst_amount: i64,
    pub final_total: i64,
    pub installments: Vec<Installment>,
    #[serde(default)]
    pub custom_total_applied: bool,
}

pub fn base_monthly_rate(board: &str, branch: &str) -> f64 {
    if branch.trim().eq_ignore_ascii_case(ONLINE_BRANCH) {
        return ONLINE_MONTHLY_RATE;
    }
    let board = board.trim();
    BOARD_MONTHLY_RATES
        .iter()
        .find(|(code, _)| code.eq_ignore_ascii_case(board))
        .map(|(_, rate)| *rate)
        .unwrap_or(DEFAULT_MONTHLY_RATE)
}

pub fn grade_multiplier(grade: &str) -> f64 {
    let g = grade.trim();
    if EARLY_GRADES.iter().any(|e| e.eq_ignore_ascii_case(g)) {
        return 1.0;
    }
    match g.parse::<i32>() {
        Ok(n) if n > 1 => GRADE_STEP.powi(n - 1),
        _ => 1.0,
    }
}

/// Named grades are accepted as-is; numeric grades must be in
/// `1..=MAX_NUMERIC_GRADE`.
pub fn is_supported_grade(grade: &str) -> bool {
    match grade.trim().parse::<i64>() {
        Ok(n) => (1..=MAX_NUMERIC_GRADE as i64).contains(&n),
        Err(_) => true,
    }
}

pub fn monthly_rate(ctx: &FeeContext, toggles: &FeeToggles) -> f64 {
    let rate = base_monthly_rate(&ctx.board, &ctx.branch) * grade_multiplier(&ctx.grade);
    if toggles.one_to_one_applied {
        rate * (1.0 + toggles.one_to_one_percentage as f64 / 100.0)
    } else {
        rate
    }
}

fn first_due_date(selections: &[SubjectSelection], today: NaiveDate) -> NaiveDate {
    selections
        .iter()
        .filter_map(|s| s.start_date)
        .min()
        .unwrap_or(today)
}

fn leading_installment(total: i64) -> i64 {
    let share = total as f64 / INSTALLMENT_COUNT as f64;
    let ceil = share.ceil() as i64;
    let rest = total.saturating_sub(ceil.saturating_mul(INSTALLMENT_COUNT as i64 - 1));
    if total >= 0 && rest < 0 {
        round_half_up(share)
    } else {
        ceil
    }
}

/// Three installments; the first two carry `ceil(total / 3)` and the last
/// absorbs the remainder so the amounts always add up to `total`. A
/// non-negative total never yields a negative last installment.
pub fn split_installments(total: i64, first_due: NaiveDate) -> Vec<Installment> {
    let amount = leading_installment(total);
    (0..INSTALLMENT_COUNT)
        .map(|i| Installment {
            amount: if i + 1 == INSTALLMENT_COUNT {
                total.saturating_sub(amount.saturating_mul(INSTALLMENT_COUNT as i64 - 1))
            } else {
                amount
            },
            due_date: first_due
                .checked_add_months(Months::new(i))
                .unwrap_or(first_due),
            paid: false,
        })
        .collect()
}

pub fn compute_fees(
    selections: &[SubjectSelection],
    ctx: &FeeContext,
    toggles: &FeeToggles,
    today: NaiveDate,
) -> FeeBreakdown {
    let first_due = first_due_date(selections, today);
    if let Some(custom) = toggles.custom_total() {
        return custom_breakdown(selections, custom, first_due);
    }

    let daily_rate = monthly_rate(ctx, toggles) / DAYS_PER_MONTH;
    let mut subject_fees = Vec::new();
    let mut raw_sum = 0.0;
    for sel in selections {
        let Some(days) = sel.billable_days() else {
            continue;
        };
        let raw = daily_rate * days as f64;
        raw_sum += raw;
        subject_fees.push(SubjectFee {
            subject: sel.name.clone(),
            fee: round_half_up(raw),
        });
    }
    let subtotal = round_half_up(raw_sum);

    let subject_pct = if selections.len() >= MULTI_SUBJECT_THRESHOLD {
        MULTI_SUBJECT_DISCOUNT_PERCENTAGE
    } else {
        0
    };
    let scholarship_pct = if toggles.scholarship_applied {
        toggles.scholarship_percentage
    } else {
        0
    };
    let subject_discount = Discount::of(subtotal, subject_pct);
    let scholarship_discount = Discount::of(subtotal, scholarship_pct);

    let base_amount = subtotal
        .saturating_sub(subject_discount.amount)
        .saturating_sub(scholarship_discount.amount);
    let gst_amount = if toggles.gst_applied {
        round_half_up(base_amount as f64 * GST_PERCENTAGE as f64 / 100.0)
    } else {
        0
    };
    let final_total = base_amount.saturating_add(gst_amount);

    FeeBreakdown {
        subject_fees,
        subtotal,
        subject_discount,
        scholarship_discount,
        base_amount,
        gst_amount,
        final_total,
        installments: split_installments(final_total, first_due),
        custom_total_applied: false,
    }
}

fn custom_breakdown(
    selections: &[SubjectSelection],
    custom: i64,
    first_due: NaiveDate,
) -> FeeBreakdown {
    let per_subject = round_half_up(custom as f64 / selections.len().max(1) as f64);
    FeeBreakdown {
        subject_fees: selections
            .iter()
            .map(|s| SubjectFee {
                subject: s.name.clone(),
                fee: per_subject,
            })
            .collect(),
        subtotal: custom,
        subject_discount: Discount::default(),
        scholarship_discount: Discount::default(),
        base_amount: custom,
        gst_amount: 0,
        final_total: custom,
        installments: split_installments(custom, first_due),
        custom_total_applied: true,
    }
}

pub fn display_amount(amount: i64, exchange_rate: f64) -> f64 {
    round_2(amount as f64 * exchange_rate * DISPLAY_MARKUP)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplaySubjectFee {
    pub subject: String,
    pub fee: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayBreakdown {
    pub currency: String,
    pub exchange_rate: f64,
    pub subject_fees: Vec<DisplaySubjectFee>,
    pub subtotal: f64,
    pub subject_discount: f64,
    pub scholarship_discount: f64,
    pub base_amount: f64,
    pub gst_amount: f64,
    pub final_total: f64,
    pub installments: Vec<f64>,
}

/// Presentation view of a breakdown in another currency. Nothing here is
/// meant to be written back into a stored breakdown.
pub fn display_breakdown(fees: &FeeBreakdown, currency: &str, exchange_rate: f64) -> DisplayBreakdown {
    let conv = |v: i64| display_amount(v, exchange_rate);
    DisplayBreakdown {
        currency: currency.to_string(),
        exchange_rate,
        subject_fees: fees
            .subject_fees
            .iter()
            .map(|s| DisplaySubjectFee {
                subject: s.subject.clone(),
                fee: conv(s.fee),
            })
            .collect(),
        subtotal: conv(fees.subtotal),
        subject_discount: conv(fees.subject_discount.amount),
        scholarship_discount: conv(fees.scholarship_discount.amount),
        base_amount: conv(fees.base_amount),
        gst_amount: conv(fees.gst_amount),
        final_total: conv(fees.final_total),
        installments: fees.installments.iter().map(|i| conv(i.amount)).collect(),
    }
}
