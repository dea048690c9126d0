use tabled::{settings::Style, Table, Tabled};

use crate::card::Card;
use crate::schema::Field;
use crate::session::Stats;

#[derive(Tabled)]
pub struct CardRow {
    #[tabled(rename = "Row")]
    pub row_id: u32,
    #[tabled(rename = "Kind")]
    pub kind: String,
    #[tabled(rename = "Name")]
    pub name: String,
    #[tabled(rename = "Email")]
    pub email: String,
    #[tabled(rename = "Popularity")]
    pub popularity: u32,
}

impl From<&Card> for CardRow {
    fn from(card: &Card) -> Self {
        let (kind, email) = if card.is_mail_list {
            let total = card.list_total.unwrap_or(0);
            ("list".to_string(), format!("{} member(s)", total))
        } else {
            ("card".to_string(), card.primary_email().to_string())
        };

        let name = if card.display_name().is_empty() {
            format!("{} {}", card.text(Field::FirstName), card.text(Field::LastName))
                .trim()
                .to_string()
        } else {
            card.display_name().to_string()
        };

        Self {
            row_id: card.row_id,
            kind,
            name,
            email,
            popularity: card.popularity_index(),
        }
    }
}

pub fn card_table(cards: &[Card]) -> String {
    if cards.is_empty() {
        return String::new();
    }

    let rows: Vec<CardRow> = cards.iter().map(CardRow::from).collect();
    Table::new(rows).with(Style::rounded()).to_string()
}

#[derive(Tabled)]
struct StatRow {
    #[tabled(rename = "Metric")]
    metric: String,
    #[tabled(rename = "Value")]
    value: String,
}

pub fn stats_table(stats: &Stats) -> String {
    let rows = vec![
        StatRow {
            metric: "Path".to_string(),
            value: stats.path.clone(),
        },
        StatRow {
            metric: "Cards".to_string(),
            value: stats.cards.to_string(),
        },
        StatRow {
            metric: "Lists".to_string(),
            value: stats.lists.to_string(),
        },
    ];
    Table::new(rows).with(Style::rounded()).to_string()
}
