use serde::{ Serialize, Deserialize };

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImPlatform {
    Whatsapp,
    Telegram,
    Messenger,
}

/// A device-side command the model asks the front end to carry out.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Email {
        recipient: String,
        subject: String,
        body: String,
    },
    Call {
        number: String,
    },
    Sms {
        number: String,
        message: String,
    },
    OpenUrl {
        url: String,
    },
    YoutubeSearch {
        query: String,
    },
    SendIm {
        platform: ImPlatform,
        recipient: String,
        message: String,
    },
}
