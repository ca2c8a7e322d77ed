//! Машина состояний диалога клиентской сессии

use anyhow::Result;

/// Высокоуровневое состояние диалога. Наблюдаемое, переходы событийные.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Listening,
    ProcessingAsr,
    ProcessingLlm,
    SendingTts,
    Interrupted,
}

impl State {
    fn parse(value: &str) -> Option<State> {
        match value {
            "idle" => Some(State::Idle),
            "listening" => Some(State::Listening),
            "processing_asr" => Some(State::ProcessingAsr),
            "processing_llm" => Some(State::ProcessingLlm),
            "sending_tts" => Some(State::SendingTts),
            "interrupted" => Some(State::Interrupted),
            _ => None,
        }
    }
}

/// Режим прослушивания, влияет на переход после tts:stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Auto,
    Manual,
    Realtime,
}

/// Детерминированная машина состояний сессии.
pub struct Machine {
    state: State,
    mode: Mode,
}

impl Machine {
    pub fn new() -> Self {
        Self {
            state: State::Idle,
            mode: Mode::Auto,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Устанавливает режим. Неизвестные значения трактуются как auto.
    pub fn set_mode(&mut self, mode: &str) {
        self.mode = match mode.trim().to_lowercase().as_str() {
            "manual" => Mode::Manual,
            "realtime" => Mode::Realtime,
            _ => Mode::Auto,
        };
    }

    pub fn on_listen_start(&mut self) {
        self.state = State::Listening;
    }

    pub fn on_audio_commit(&mut self) {
        self.state = State::ProcessingAsr;
    }

    pub fn on_conversation_start(&mut self) {
        self.state = State::ProcessingLlm;
    }

    pub fn on_tts_start(&mut self) {
        self.state = State::SendingTts;
    }

    /// Выход из озвучки: manual возвращается в idle, остальные режимы слушают дальше.
    pub fn on_tts_stop(&mut self) {
        self.state = match self.mode {
            Mode::Manual => State::Idle,
            _ => State::Listening,
        };
    }

    pub fn on_interrupt(&mut self) {
        self.state = State::Interrupted;
    }

    /// Безусловно выставляет состояние, ошибка на неизвестном имени.
    pub fn force(&mut self, state: &str) -> Result<()> {
        match State::parse(state) {
            Some(state) => {
                self.state = state;
                Ok(())
            }
            None => anyhow::bail!("invalid state: {}", state),
        }
    }
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_default() {
        let machine = Machine::new();
        assert_eq!(machine.state(), State::Idle);
        assert_eq!(machine.mode(), Mode::Auto);
    }

    #[test]
    fn test_lifecycle_auto() {
        let mut machine = Machine::new();
        machine.on_listen_start();
        machine.on_audio_commit();
        machine.on_conversation_start();
        machine.on_tts_start();
        machine.on_tts_stop();
        assert_eq!(machine.state(), State::Listening);
    }

    #[test]
    fn test_lifecycle_manual() {
        let mut machine = Machine::new();
        machine.set_mode("manual");
        machine.on_listen_start();
        machine.on_tts_start();
        machine.on_tts_stop();
        assert_eq!(machine.state(), State::Idle);
    }

    #[test]
    fn test_lifecycle_realtime() {
        let mut machine = Machine::new();
        machine.set_mode("realtime");
        machine.on_listen_start();
        machine.on_tts_start();
        machine.on_tts_stop();
        assert_eq!(machine.state(), State::Listening);
    }

    #[test]
    fn test_set_mode_is_case_insensitive() {
        let mut machine = Machine::new();
        machine.set_mode(" MANUAL ");
        assert_eq!(machine.mode(), Mode::Manual);
        machine.set_mode("nonsense");
        assert_eq!(machine.mode(), Mode::Auto);
    }

    #[test]
    fn test_force() {
        let mut machine = Machine::new();
        machine.force("sending_tts").expect("force valid state");
        assert_eq!(machine.state(), State::SendingTts);
        assert!(machine.force("unknown").is_err());
    }
}
